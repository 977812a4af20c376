//! Word-budget pagination of chapter markup
//!
//! A page budget (words per page) is estimated from viewport and font
//! metrics, then chapter markup is cut into block-level units and packed
//! greedily into pages. Units are never split.
//!
//! Only the inner markup of `<body>` is split. Split pages carry body units
//! alone, without the document head or the `<body>` wrapper. A chapter that
//! fits in one page, or that has no unit to cut at, is returned whole.

use serde::{Deserialize, Serialize};

use crate::error::PaginationError;

/// Lower bound of the words-per-page estimate
pub const MIN_WORDS_PER_PAGE: usize = 150;
/// Upper bound of the words-per-page estimate
pub const MAX_WORDS_PER_PAGE: usize = 400;

/// Approximate glyph advance as a fraction of the font size
const CHAR_WIDTH_FACTOR: f64 = 0.6;
/// Average word length in characters, including the separating space
const AVG_WORD_CHARS: f64 = 6.0;

/// Closing tags that end a block-level unit
const BLOCK_CLOSERS: &[&str] = &[
    "p",
    "div",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "blockquote",
    "li",
];

/// Display area available to page content, in pixels
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    /// Usable width
    pub width: f32,
    /// Usable height
    pub height: f32,
}

impl Viewport {
    /// Display width in pixels
    pub const DISPLAY_WIDTH: f32 = 480.0;
    /// Display height in pixels
    pub const DISPLAY_HEIGHT: f32 = 800.0;

    /// Create a viewport of the given size.
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(Self::DISPLAY_WIDTH, Self::DISPLAY_HEIGHT)
    }
}

/// Viewport plus font metrics; pages are only valid for the config that
/// produced them
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    /// Usable display area
    pub viewport: Viewport,
    /// Font size in pixels
    pub font_size: f32,
    /// Line height in pixels
    pub line_height: f32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            viewport: Viewport::default(),
            font_size: 16.0,
            line_height: 24.0,
        }
    }
}

impl PaginationConfig {
    /// Set the viewport.
    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = viewport;
        self
    }

    /// Set the font size.
    pub fn with_font_size(mut self, font_size: f32) -> Self {
        self.font_size = font_size;
        self
    }

    /// Set the line height.
    pub fn with_line_height(mut self, line_height: f32) -> Self {
        self.line_height = line_height;
        self
    }

    /// Words-per-page budget for this configuration.
    pub fn words_per_page(&self) -> usize {
        estimate_page_budget(self.viewport, self.font_size, self.line_height)
    }
}

/// One page of a chapter
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Page markup
    pub content: String,
    /// Index of the chapter within its chunk
    pub chapter_index: usize,
    /// 0-based page index within the chapter
    pub page_index: usize,
    /// Number of pages the chapter was split into
    pub total_pages_in_chapter: usize,
}

/// Estimate how many words fit on one page.
///
/// Always within `[MIN_WORDS_PER_PAGE, MAX_WORDS_PER_PAGE]`, including for
/// zero, negative and non-finite metrics.
pub fn estimate_page_budget(viewport: Viewport, font_size: f32, line_height: f32) -> usize {
    let char_width = font_size as f64 * CHAR_WIDTH_FACTOR;
    let chars_per_line = (viewport.width as f64 / char_width).floor();
    let lines_per_page = (viewport.height as f64 / line_height as f64).floor();
    let words = (chars_per_line * lines_per_page / AVG_WORD_CHARS).floor();

    if words.is_nan() {
        return MIN_WORDS_PER_PAGE;
    }
    words.clamp(MIN_WORDS_PER_PAGE as f64, MAX_WORDS_PER_PAGE as f64) as usize
}

/// Count whitespace-separated words in the text content of `markup`.
pub fn count_words(markup: &str) -> usize {
    strip_tags(markup).split_whitespace().count()
}

/// Replace tags with spaces and decode the common entities.
fn strip_tags(markup: &str) -> String {
    let mut text = String::with_capacity(markup.len());
    let mut in_tag = false;
    for ch in markup.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

/// Inner markup of `<body>`, or the whole input when there is no body.
fn body_inner(markup: &str) -> &str {
    let lower = markup.to_ascii_lowercase();
    let Some(open) = lower.find("<body") else {
        return markup;
    };
    let Some(open_end) = lower[open..].find('>').map(|i| open + i + 1) else {
        return markup;
    };
    let close = lower.rfind("</body").filter(|&c| c >= open_end).unwrap_or(markup.len());
    &markup[open_end..close]
}

/// Length of a block closing tag (`</p>`, `</li >`, ...) at the start of
/// `lower`, if there is one.
fn block_closer_len(lower: &str) -> Option<usize> {
    let rest = lower.strip_prefix("</")?;
    BLOCK_CLOSERS.iter().find_map(|name| {
        let after = rest.strip_prefix(name)?;
        let trimmed = after.trim_start_matches(|c: char| c.is_ascii_whitespace());
        trimmed
            .starts_with('>')
            .then(|| 2 + name.len() + (after.len() - trimmed.len()) + 1)
    })
}

/// Split markup into block-level units, cutting after each recognized
/// closing tag (case-insensitive). Units are trimmed; empty ones dropped.
pub fn split_block_units(markup: &str) -> Vec<&str> {
    let lower = markup.to_ascii_lowercase();
    let mut units = Vec::new();
    let mut start = 0;

    for (idx, _) in lower.match_indices("</") {
        if idx < start {
            continue;
        }
        if let Some(len) = block_closer_len(&lower[idx..]) {
            let end = idx + len;
            let unit = markup[start..end].trim();
            if !unit.is_empty() {
                units.push(unit);
            }
            start = end;
        }
    }

    let tail = markup[start..].trim();
    if !tail.is_empty() {
        units.push(tail);
    }
    units
}

fn has_block_closer(markup: &str) -> bool {
    let lower = markup.to_ascii_lowercase();
    lower
        .match_indices("</")
        .any(|(idx, _)| block_closer_len(&lower[idx..]).is_some())
}

/// Paginate one chapter against a word budget.
///
/// Fails with `NoBlockUnits` when the chapter is over budget but has no
/// block-level closing tag to cut at.
pub fn try_paginate(
    markup: &str,
    words_per_page: usize,
    chapter_index: usize,
) -> Result<Vec<Page>, PaginationError> {
    let body = body_inner(markup);
    let total_words = count_words(body);
    if total_words <= words_per_page {
        return Ok(vec![Page {
            content: markup.to_string(),
            chapter_index,
            page_index: 0,
            total_pages_in_chapter: 1,
        }]);
    }
    if !has_block_closer(body) {
        return Err(PaginationError::NoBlockUnits);
    }

    let mut pages: Vec<Page> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_words = 0usize;

    for unit in split_block_units(body) {
        let unit_words = count_words(unit);
        if !current.is_empty() && current_words + unit_words > words_per_page {
            pages.push(Page {
                content: current.concat(),
                chapter_index,
                page_index: pages.len(),
                total_pages_in_chapter: 0,
            });
            current.clear();
            current_words = 0;
        }
        current.push(unit);
        current_words += unit_words;
    }
    if !current.is_empty() {
        pages.push(Page {
            content: current.concat(),
            chapter_index,
            page_index: pages.len(),
            total_pages_in_chapter: 0,
        });
    }

    let total = pages.len();
    for page in &mut pages {
        page.total_pages_in_chapter = total;
    }

    log::debug!(
        "[PAGINATE] chapter {}: {} words -> {} pages (budget {})",
        chapter_index,
        total_words,
        total,
        words_per_page
    );
    Ok(pages)
}

/// Paginate one chapter, falling back to a single page of the original
/// markup when it cannot be segmented.
pub fn paginate(markup: &str, words_per_page: usize, chapter_index: usize) -> Vec<Page> {
    match try_paginate(markup, words_per_page, chapter_index) {
        Ok(pages) => pages,
        Err(err) => {
            log::warn!(
                "[PAGINATE] chapter {}: {}, using a single page",
                chapter_index,
                err
            );
            vec![Page {
                content: markup.to_string(),
                chapter_index,
                page_index: 0,
                total_pages_in_chapter: 1,
            }]
        }
    }
}
