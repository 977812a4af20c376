//! calico - read EPUB books from the terminal

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use calico::{
    ArchiveReader, BookMetadata, JsonFileStore, Library, ReaderConfig, ReaderPosition,
    ReaderSession, ReadingProgress,
};

#[derive(Parser)]
#[command(name = "calico")]
#[command(version, about = "Chunked, paginated EPUB reader", long_about = None)]
#[command(after_help = "EXAMPLES:
    calico import book.epub          Add a book to the library
    calico list                      List library books
    calico read <KEY> --next 3       Turn three pages and print the page")]
struct Cli {
    /// Library store file
    #[arg(long, value_name = "PATH", default_value = "calico-store.json", global = true)]
    store: PathBuf,

    /// Reader configuration (JSON)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import an EPUB into the library
    Import {
        /// EPUB file
        epub: String,
    },
    /// List library books
    List,
    /// Remove a book and its saved position
    Remove {
        /// Book key
        key: String,
    },
    /// Plan (if needed) and print a book's chunk map
    Chunks {
        /// Book key
        key: String,
    },
    /// Open a book at its saved position, move, and print the page
    Read {
        /// Book key
        key: String,
        /// Jump to CHUNK:CHAPTER:PAGE first
        #[arg(long, value_name = "C:H:P", value_parser = parse_position)]
        goto: Option<ReaderPosition>,
        /// Pages to advance
        #[arg(long, default_value_t = 0)]
        next: usize,
        /// Pages to go back
        #[arg(long, default_value_t = 0)]
        prev: usize,
        /// Viewport width in px
        #[arg(long)]
        width: Option<f32>,
        /// Viewport height in px
        #[arg(long)]
        height: Option<f32>,
        /// Font size in px
        #[arg(long)]
        font_size: Option<f32>,
        /// Line height in px
        #[arg(long)]
        line_height: Option<f32>,
    },
}

fn parse_position(raw: &str) -> Result<ReaderPosition, String> {
    let parts = raw
        .split(':')
        .map(|part| part.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid position '{raw}': {e}"))?;
    match parts.as_slice() {
        [chunk, chapter, page] => Ok(ReaderPosition::new(*chunk, *chapter, *page)),
        _ => Err(format!("invalid position '{raw}': expected CHUNK:CHAPTER:PAGE")),
    }
}

#[derive(Serialize)]
struct ReadOutput<'a> {
    key: &'a str,
    title: &'a str,
    position: Option<ReaderPosition>,
    chapter_path: Option<&'a str>,
    words_per_page: usize,
    progress: ReadingProgress,
    page: Option<&'a calico::Page>,
}

#[derive(Serialize)]
struct BookSummary<'a> {
    key: &'a str,
    title: &'a str,
    author: &'a str,
    path: &'a str,
    chunks: Option<usize>,
}

impl<'a> From<&'a BookMetadata> for BookSummary<'a> {
    fn from(book: &'a BookMetadata) -> Self {
        Self {
            key: &book.key,
            title: &book.title,
            author: &book.author,
            path: &book.path,
            chunks: book.chunks.as_ref().map(|c| c.len()),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calico=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ReaderConfig, String> {
    let Some(path) = path else {
        return Ok(ReaderConfig::default());
    };
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{text}");
    Ok(())
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = load_config(cli.config.as_deref())?;
    let store = JsonFileStore::open(&cli.store).map_err(|e| e.to_string())?;
    let library = Library::new(Arc::new(store));
    let archives = Arc::new(ArchiveReader::new().with_zip_limits(config.zip_limits));

    match cli.command {
        Command::Import { epub } => {
            let book = library.import(&archives, &epub).map_err(|e| e.to_string())?;
            print_json(&BookSummary::from(&book))
        }
        Command::List => {
            let books = library.list().map_err(|e| e.to_string())?;
            let summaries: Vec<BookSummary<'_>> = books.iter().map(BookSummary::from).collect();
            print_json(&summaries)
        }
        Command::Remove { key } => {
            library.remove(&key).map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({ "removed": key }))
        }
        Command::Chunks { key } => {
            let mut book = library.get(&key).map_err(|e| e.to_string())?;
            if book.chunks.is_none() {
                let handle = archives.lease(&book.path).map_err(|e| e.to_string())?;
                let chunks = calico::library::plan_book_chunks(&handle, config.max_chunk_bytes)
                    .map_err(|e| e.to_string())?;
                book.chunks = Some(chunks);
                library.update(&book).map_err(|e| e.to_string())?;
            }
            print_json(&book.chunks)
        }
        Command::Read {
            key,
            goto,
            next,
            prev,
            width,
            height,
            font_size,
            line_height,
        } => {
            let mut pagination = config.pagination;
            if let Some(width) = width {
                pagination.viewport.width = width;
            }
            if let Some(height) = height {
                pagination.viewport.height = height;
            }
            if let Some(font_size) = font_size {
                pagination = pagination.with_font_size(font_size);
            }
            if let Some(line_height) = line_height {
                pagination = pagination.with_line_height(line_height);
            }
            let config = config.with_pagination(pagination).with_autosave(false);

            let mut session = ReaderSession::new(archives, library, config);
            session.resume(&key).await.map_err(|e| e.to_string())?;
            if let Some(target) = goto {
                session
                    .navigate_to_position(target.chunk, target.chapter, target.page)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            for _ in 0..next {
                session.next_page().await.map_err(|e| e.to_string())?;
            }
            for _ in 0..prev {
                session.prev_page().await.map_err(|e| e.to_string())?;
            }
            session.save_progress().map_err(|e| e.to_string())?;

            let title = session.book().map(|b| b.title.clone()).unwrap_or_default();
            let output = ReadOutput {
                key: &key,
                title: &title,
                position: session.position(),
                chapter_path: session.current_chapter_path(),
                words_per_page: session.words_per_page(),
                progress: session.reading_progress(),
                page: session.current_page(),
            };
            let result = print_json(&output);
            session.close();
            result
        }
    }
}
