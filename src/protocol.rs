//! Rendering-surface protocol and the session actor
//!
//! A rendering surface talks to the engine through an inbound event stream:
//! navigation intents (`prev`, `next`, `middle`) and, when the surface
//! reflows chapters itself, position reports. [`SessionHandle`] owns a
//! [`ReaderSession`] on a tokio task and serves requests from a single FIFO
//! queue, so requests apply strictly in the order they were accepted.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{ProtocolError, ReaderError};
use crate::layout::{Page, PaginationConfig};
use crate::session::{NavOutcome, ReaderPosition, ReaderSession, ReadingProgress, SessionStatus};

/// Pending requests a handle can queue before senders wait
const COMMAND_QUEUE_DEPTH: usize = 32;

/// Navigation request from the rendering surface
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NavigationIntent {
    /// Previous page
    Prev,
    /// Next page
    Next,
    /// Tap in the middle third (menu toggle); never moves the position
    MiddleTap,
}

impl FromStr for NavigationIntent {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "prev" | "prevPage" => Ok(Self::Prev),
            "next" | "nextPage" => Ok(Self::Next),
            "middle" | "middleTap" | "middle-tap" => Ok(Self::MiddleTap),
            other => Err(ProtocolError::Unrecognized(other.to_string())),
        }
    }
}

/// Position report exchanged with a reflowing surface
///
/// `current_chapter` is the chapter index within the current chunk;
/// `chapter_path` identifies the chapter and is what the session matches on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionReport {
    /// Chapter index within the current chunk
    pub current_chapter: usize,
    /// Page index within the chapter
    pub current_page: usize,
    /// Archive path of the chapter
    pub chapter_path: String,
    /// Chapters in the current chunk
    pub total_chapters: usize,
    /// Pages in the chapter as laid out by the surface
    pub total_pages_in_chapter: usize,
}

impl PositionReport {
    /// Describe the session's current position in report form.
    pub fn capture(session: &ReaderSession) -> Option<Self> {
        let position = session.position()?;
        let chapter_path = session.current_chapter_path()?.to_string();
        let total_chapters = session
            .chunk_map()
            .and_then(|map| map.chapters(position.chunk))
            .map_or(0, <[String]>::len);
        Some(Self {
            current_chapter: position.chapter,
            current_page: position.page,
            chapter_path,
            total_chapters,
            total_pages_in_chapter: session.pages_in_current_chapter(),
        })
    }
}

/// One message from the rendering surface
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundMessage {
    /// Navigation intent
    Intent(NavigationIntent),
    /// Position report
    Position(PositionReport),
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum TypedMessage {
    #[serde(rename = "prevPage", alias = "prev")]
    Prev,
    #[serde(rename = "nextPage", alias = "next")]
    Next,
    #[serde(rename = "middleTap", alias = "middle")]
    MiddleTap,
    #[serde(rename = "position")]
    Position(PositionReport),
}

impl InboundMessage {
    /// Parse a raw surface message.
    ///
    /// Accepts bare intent strings (`next`), JSON strings (`"next"`), typed
    /// JSON objects (`{"type":"nextPage"}`, `{"type":"position", ...}`) and
    /// untyped position report objects.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let trimmed = raw.trim();
        if let Ok(intent) = trimmed.parse::<NavigationIntent>() {
            return Ok(Self::Intent(intent));
        }
        if let Ok(text) = serde_json::from_str::<String>(trimmed) {
            return text.parse().map(Self::Intent);
        }
        if let Ok(typed) = serde_json::from_str::<TypedMessage>(trimmed) {
            return Ok(match typed {
                TypedMessage::Prev => Self::Intent(NavigationIntent::Prev),
                TypedMessage::Next => Self::Intent(NavigationIntent::Next),
                TypedMessage::MiddleTap => Self::Intent(NavigationIntent::MiddleTap),
                TypedMessage::Position(report) => Self::Position(report),
            });
        }
        serde_json::from_str::<PositionReport>(trimmed)
            .map(Self::Position)
            .map_err(|_| ProtocolError::Unrecognized(trimmed.to_string()))
    }
}

/// Result of dispatching an inbound message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatched {
    /// A page turn was applied (or hit a boundary)
    Navigated(NavOutcome),
    /// Middle tap; the surface decides what to show
    MiddleTap,
    /// A report was adopted
    Adopted(ReaderPosition),
    /// A report referred to a chapter outside the current chunk
    Stale,
}

/// Point-in-time view of the session
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// Current position, if a document is loaded
    pub position: Option<ReaderPosition>,
    /// Archive path of the current chapter
    pub chapter_path: Option<String>,
    /// Page at the current position
    pub page: Option<Page>,
    /// Progress through the book
    pub progress: ReadingProgress,
}

impl SessionSnapshot {
    fn capture(session: &ReaderSession) -> Self {
        Self {
            position: session.position(),
            chapter_path: session.current_chapter_path().map(str::to_string),
            page: session.current_page().cloned(),
            progress: session.reading_progress(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, ReaderError>>;

enum Command {
    Load {
        key: String,
        resume: bool,
        reply: Reply<ReaderPosition>,
    },
    Inbound {
        message: InboundMessage,
        reply: Reply<Dispatched>,
    },
    Goto {
        position: ReaderPosition,
        reply: Reply<ReaderPosition>,
    },
    LoadChunk {
        chunk: usize,
        reply: Reply<ReaderPosition>,
    },
    Pagination {
        config: PaginationConfig,
        reply: Reply<ReaderPosition>,
    },
    Save {
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
}

async fn dispatch(
    session: &mut ReaderSession,
    message: InboundMessage,
) -> Result<Dispatched, ReaderError> {
    match message {
        InboundMessage::Intent(NavigationIntent::Next) => {
            session.next_page().await.map(Dispatched::Navigated)
        }
        InboundMessage::Intent(NavigationIntent::Prev) => {
            session.prev_page().await.map(Dispatched::Navigated)
        }
        InboundMessage::Intent(NavigationIntent::MiddleTap) => Ok(Dispatched::MiddleTap),
        InboundMessage::Position(report) => {
            let adopted = session.apply_surface_report(
                &report.chapter_path,
                report.current_page,
                report.total_pages_in_chapter,
            )?;
            Ok(adopted.map_or(Dispatched::Stale, Dispatched::Adopted))
        }
    }
}

async fn execute(session: &mut ReaderSession, command: Command) {
    // A dropped reply means the caller stopped waiting; the work still applies.
    match command {
        Command::Load { key, resume, reply } => {
            let result = if resume {
                session.resume(&key).await
            } else {
                session.load_document(&key).await
            };
            let _ = reply.send(result);
        }
        Command::Inbound { message, reply } => {
            let _ = reply.send(dispatch(session, message).await);
        }
        Command::Goto { position, reply } => {
            let result = session
                .navigate_to_position(position.chunk, position.chapter, position.page)
                .await;
            let _ = reply.send(result);
        }
        Command::LoadChunk { chunk, reply } => {
            let _ = reply.send(session.load_chunk_content(chunk).await);
        }
        Command::Pagination { config, reply } => {
            let _ = reply.send(session.update_pagination(config).await);
        }
        Command::Save { reply } => {
            let _ = reply.send(session.save_progress());
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(Ok(SessionSnapshot::capture(session)));
        }
    }
}

async fn run(
    mut session: ReaderSession,
    mut commands: mpsc::Receiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                log::info!("[SESSION] Close requested; dropping in-flight request");
                break;
            }
            _ = execute(&mut session, command) => {}
        }
    }

    session.close();
    commands.close();
    let mut dropped = 0usize;
    while commands.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        log::info!("[SESSION] Dropped {} pending requests", dropped);
    }
}

/// Cloneable handle to a session running on its own tokio task
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Move `session` onto a tokio task. Must be called inside a runtime.
    pub fn spawn(session: ReaderSession) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let status = session.subscribe();
        tokio::spawn(run(session, rx, shutdown_rx));
        Self {
            commands,
            shutdown,
            status,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ReaderError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| ReaderError::SessionClosed)?;
        response.await.map_err(|_| ReaderError::SessionClosed)?
    }

    /// Load a book and land on its first page.
    pub async fn load_document(&self, key: &str) -> Result<ReaderPosition, ReaderError> {
        let key = key.to_string();
        self.request(|reply| Command::Load {
            key,
            resume: false,
            reply,
        })
        .await
    }

    /// Load a book and restore its saved position.
    pub async fn resume(&self, key: &str) -> Result<ReaderPosition, ReaderError> {
        let key = key.to_string();
        self.request(|reply| Command::Load {
            key,
            resume: true,
            reply,
        })
        .await
    }

    /// Queue an inbound surface message.
    pub async fn send(&self, message: InboundMessage) -> Result<Dispatched, ReaderError> {
        self.request(|reply| Command::Inbound { message, reply })
            .await
    }

    /// Parse and queue a raw surface message.
    pub async fn send_raw(&self, raw: &str) -> Result<Dispatched, ReaderError> {
        let message = InboundMessage::parse(raw)?;
        self.send(message).await
    }

    /// Queue a page turn.
    pub async fn intent(&self, intent: NavigationIntent) -> Result<Dispatched, ReaderError> {
        self.send(InboundMessage::Intent(intent)).await
    }

    /// Jump to a position (clamped).
    pub async fn navigate_to_position(
        &self,
        position: ReaderPosition,
    ) -> Result<ReaderPosition, ReaderError> {
        self.request(|reply| Command::Goto { position, reply })
            .await
    }

    /// Land on the first page of chunk `chunk` (clamped).
    pub async fn load_chunk_content(&self, chunk: usize) -> Result<ReaderPosition, ReaderError> {
        self.request(|reply| Command::LoadChunk { chunk, reply })
            .await
    }

    /// Change pagination settings.
    pub async fn update_pagination(
        &self,
        config: PaginationConfig,
    ) -> Result<ReaderPosition, ReaderError> {
        self.request(|reply| Command::Pagination { config, reply })
            .await
    }

    /// Persist the current position.
    pub async fn save_progress(&self) -> Result<(), ReaderError> {
        self.request(|reply| Command::Save { reply }).await
    }

    /// Current position, page and progress.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, ReaderError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Latest published status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Whether the session task has shut down.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Shut the session down: the in-flight request and every queued one
    /// are dropped (callers get `SessionClosed`), and the archive is released.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        self.commands.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_intents() {
        assert_eq!(
            InboundMessage::parse("prev").unwrap(),
            InboundMessage::Intent(NavigationIntent::Prev)
        );
        assert_eq!(
            InboundMessage::parse(" next\n").unwrap(),
            InboundMessage::Intent(NavigationIntent::Next)
        );
        assert_eq!(
            InboundMessage::parse("middle").unwrap(),
            InboundMessage::Intent(NavigationIntent::MiddleTap)
        );
        assert_eq!(
            InboundMessage::parse("\"next\"").unwrap(),
            InboundMessage::Intent(NavigationIntent::Next)
        );
    }

    #[test]
    fn test_parse_typed_objects() {
        assert_eq!(
            InboundMessage::parse(r#"{"type":"middleTap"}"#).unwrap(),
            InboundMessage::Intent(NavigationIntent::MiddleTap)
        );
        assert_eq!(
            InboundMessage::parse(r#"{"type":"prevPage"}"#).unwrap(),
            InboundMessage::Intent(NavigationIntent::Prev)
        );
    }

    #[test]
    fn test_parse_position_report() {
        let raw = r#"{"currentChapter":1,"currentPage":3,"chapterPath":"OEBPS/c2.xhtml",
            "totalChapters":4,"totalPagesInChapter":7}"#;
        let expected = PositionReport {
            current_chapter: 1,
            current_page: 3,
            chapter_path: "OEBPS/c2.xhtml".into(),
            total_chapters: 4,
            total_pages_in_chapter: 7,
        };
        assert_eq!(
            InboundMessage::parse(raw).unwrap(),
            InboundMessage::Position(expected.clone())
        );

        let typed = r#"{"type":"position","currentChapter":1,"currentPage":3,
            "chapterPath":"OEBPS/c2.xhtml","totalChapters":4,"totalPagesInChapter":7}"#;
        assert_eq!(
            InboundMessage::parse(typed).unwrap(),
            InboundMessage::Position(expected)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            InboundMessage::parse("sideways"),
            Err(ProtocolError::Unrecognized(_))
        ));
        assert!(InboundMessage::parse(r#"{"type":"goToChapter"}"#).is_err());
        assert!(InboundMessage::parse(r#"{"chapterPath":"a"}"#).is_err());
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = PositionReport {
            current_chapter: 0,
            current_page: 1,
            chapter_path: "a.xhtml".into(),
            total_chapters: 2,
            total_pages_in_chapter: 3,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["chapterPath"], "a.xhtml");
        assert_eq!(json["totalPagesInChapter"], 3);
    }
}
