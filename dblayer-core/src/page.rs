//! Page results for windowed reads.
//!
//! [`Collection::find_page`](crate::collection::Collection::find_page) pairs a
//! count of all matches with one window of them, described by [`PaginationParams`].

use serde::{Deserialize, Serialize};

/// One page of results plus navigation metadata.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of matches across all pages.
    pub count: u64,
    pub next_page: Option<usize>,
    pub previous_page: Option<usize>,
}

impl<T> Page<T> {
    /// Builds the page at `params` out of its items and the total match count.
    ///
    /// ```ignore
    /// use dblayer::page::{Page, PaginationParams};
    ///
    /// let page = Page::from_window(vec!["k", "l"], 12, &PaginationParams::new(2, 10));
    /// assert_eq!(page.previous_page, Some(1));
    /// assert_eq!(page.next_page, None);
    /// ```
    pub fn from_window(items: Vec<T>, count: u64, params: &PaginationParams) -> Self {
        let page = params.page();
        let end = params.offset().saturating_add(items.len()) as u64;

        Self {
            items,
            count,
            next_page: (end < count).then(|| page.saturating_add(1)),
            previous_page: (page > 1).then(|| page - 1),
        }
    }

    /// Maps every item, keeping the navigation metadata.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            count: self.count,
            next_page: self.next_page,
            previous_page: self.previous_page,
        }
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            count: 0,
            next_page: None,
            previous_page: None,
        }
    }
}

/// Which page to read and how large pages are. Pages are 1-indexed; page 0 is
/// treated as page 1 and a page size of 0 as 1.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PaginationParams {
    pub page: usize,
    pub per_page: usize,
}

impl PaginationParams {
    pub fn new(page: usize, per_page: usize) -> Self {
        Self { page, per_page }
    }

    fn page(&self) -> usize {
        self.page.max(1)
    }

    /// Effective page size, never zero.
    pub fn limit(&self) -> usize {
        self.per_page.max(1)
    }

    /// Number of items before this page, saturating for out-of-range pages.
    pub fn offset(&self) -> usize {
        (self.page() - 1).saturating_mul(self.limit())
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self { page: 1, per_page: 10 }
    }
}
