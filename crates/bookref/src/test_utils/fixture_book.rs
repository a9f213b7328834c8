//! Deterministic fixture book generator for benchmarks and tests.
//!
//! Generates synthetic bookdown projects with a controlled number of chapters,
//! sections, figures and text references, together with the index entries the
//! bundled writer produces for them.
//!
//! All output is deterministic, so benchmarks are reproducible.

use std::fmt::Write;
use std::path::Path;
use tempfile::TempDir;

/// Configuration for generating a fixture book.
#[derive(Debug, Clone)]
pub struct FixtureBookConfig {
    pub chapter_count: usize,
    pub sections_per_chapter: usize,
    pub figures_per_chapter: usize,
    /// Figures whose caption is given through a `(ref:...)` text reference
    pub text_refs_per_chapter: usize,
}

impl FixtureBookConfig {
    /// Small book: 5 chapters, 3 sections and 2 figures each.
    pub fn small() -> Self {
        Self {
            chapter_count: 5,
            sections_per_chapter: 3,
            figures_per_chapter: 2,
            text_refs_per_chapter: 1,
        }
    }

    /// Medium book: 20 chapters, 8 sections and 5 figures each.
    pub fn medium() -> Self {
        Self {
            chapter_count: 20,
            sections_per_chapter: 8,
            figures_per_chapter: 5,
            text_refs_per_chapter: 3,
        }
    }

    /// Large book: 60 chapters, 15 sections and 10 figures each.
    pub fn large() -> Self {
        Self {
            chapter_count: 60,
            sections_per_chapter: 15,
            figures_per_chapter: 10,
            text_refs_per_chapter: 5,
        }
    }

    /// Total number of records the book's index converts to
    pub fn record_count(&self) -> usize {
        self.chapter_count * (1 + self.sections_per_chapter + self.figures_per_chapter)
    }
}

/// File name of the chapter at `index` (0-based)
pub fn chapter_file_name(index: usize) -> String {
    format!("{:02}-chapter.Rmd", index + 1)
}

/// Generate the R Markdown source of a chapter.
pub fn generate_chapter_rmd(index: usize, config: &FixtureBookConfig) -> String {
    let mut content = String::new();
    let chapter = index + 1;

    writeln!(content, "# Chapter {} {{#ch{}}}", chapter, chapter).unwrap();
    content.push('\n');

    for s in 0..config.sections_per_chapter {
        writeln!(content, "## Section {}.{} {{#sec{}-{}}}", chapter, s + 1, chapter, s + 1).unwrap();
        content.push('\n');
        writeln!(content, "Some text about section {}.{}.", chapter, s + 1).unwrap();
        content.push('\n');
    }

    for f in 0..config.figures_per_chapter {
        let label = format!("plot{}-{}", chapter, f + 1);
        if f < config.text_refs_per_chapter {
            writeln!(content, "(ref:{}-cap) Caption of figure {}.{}", label, chapter, f + 1).unwrap();
            content.push('\n');
            writeln!(content, "```{{r {}, fig.cap=\"(ref:{}-cap)\"}}", label, label).unwrap();
        } else {
            writeln!(content, "```{{r {}, fig.cap=\"Figure {}.{}\"}}", label, chapter, f + 1).unwrap();
        }
        writeln!(content, "plot(cars)").unwrap();
        writeln!(content, "```").unwrap();
        content.push('\n');
    }

    content
}

/// Generate the index entries the writer emits for a chapter, in document order.
pub fn generate_chapter_entries(index: usize, config: &FixtureBookConfig) -> Vec<String> {
    let chapter = index + 1;
    let mut entries = vec![format!("h1:ch{} Chapter {}", chapter, chapter)];

    for s in 0..config.sections_per_chapter {
        entries.push(format!(
            "h2:sec{}-{} Section {}.{}",
            chapter,
            s + 1,
            chapter,
            s + 1
        ));
    }

    for f in 0..config.figures_per_chapter {
        let label = format!("plot{}-{}", chapter, f + 1);
        if f < config.text_refs_per_chapter {
            entries.push(format!(
                "(ref:{}-cap) Caption of figure {}.{}",
                label,
                chapter,
                f + 1
            ));
            entries.push(format!("fig:{} (ref:{}-cap)", label, label));
        } else {
            entries.push(format!("fig:{} Figure {}.{}", label, chapter, f + 1));
        }
    }

    entries
}

/// Create a temporary fixture book from the given configuration.
///
/// The directory holds `_bookdown.yml`, an `index.Rmd` and one file per
/// chapter, and is removed when the `TempDir` is dropped.
pub fn create_fixture_book(config: &FixtureBookConfig) -> TempDir {
    let temp_dir = TempDir::new().expect("Failed to create temp directory for fixture book");
    write_fixture_book(temp_dir.path(), config);
    temp_dir
}

/// Write fixture files into an existing directory.
pub fn write_fixture_book(dir: &Path, config: &FixtureBookConfig) {
    let write = |name: &str, content: &str| {
        std::fs::write(dir.join(name), content)
            .unwrap_or_else(|e| panic!("Failed to write fixture file {}: {}", name, e));
    };

    let mut rmd_files = String::from("rmd_files:\n  - index.Rmd\n");
    for i in 0..config.chapter_count {
        writeln!(rmd_files, "  - {}", chapter_file_name(i)).unwrap();
    }
    write("_bookdown.yml", &format!("book_filename: fixture\n{}", rmd_files));
    write(
        "index.Rmd",
        "---\ntitle: Fixture Book\nsite: bookdown::bookdown_site\n---\n\n# Preface {-}\n",
    );

    for i in 0..config.chapter_count {
        write(&chapter_file_name(i), &generate_chapter_rmd(i, config));
    }
}
