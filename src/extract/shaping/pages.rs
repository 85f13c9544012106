//! Chunk-local page numbering for decks processed a window of pages at a time.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Absolute, 1-based, inclusive page range covered by one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: u32,
    pub end: u32,
}

impl ChunkRange {
    /// Number of pages in the range (saturating for inverted ranges).
    pub fn page_span(&self) -> u32 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk range {start}-{end} is inverted or starts below page 1")]
    InvalidRange { start: u32, end: u32 },
    #[error("chunk range {start}-{end} covers {expected} pages but {actual} were supplied")]
    LengthMismatch {
        start: u32,
        end: u32,
        expected: u32,
        actual: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageResolution {
    /// 1-based page within the chunk.
    pub local: u32,
    /// True when the model answered with an absolute page number.
    pub remapped: bool,
}

/// Mapping between chunk-local and absolute page numbers for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapping {
    page_count: u32,
    chunk: Option<ChunkRange>,
}

impl PageMapping {
    pub fn new(page_count: u32, chunk: Option<ChunkRange>) -> Result<Self, ChunkError> {
        if let Some(range) = chunk {
            if range.start == 0 || range.end < range.start {
                return Err(ChunkError::InvalidRange {
                    start: range.start,
                    end: range.end,
                });
            }
            if range.page_span() != page_count {
                return Err(ChunkError::LengthMismatch {
                    start: range.start,
                    end: range.end,
                    expected: range.page_span(),
                    actual: page_count,
                });
            }
        }
        Ok(Self { page_count, chunk })
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn chunk(&self) -> Option<ChunkRange> {
        self.chunk
    }

    /// Accept a chunk-local page, or an absolute page inside the chunk
    /// (remapped to local). Local interpretation wins when both apply.
    pub fn resolve(&self, page: i64) -> Option<PageResolution> {
        if page >= 1 && page <= i64::from(self.page_count) {
            return Some(PageResolution {
                local: page as u32,
                remapped: false,
            });
        }
        let range = self.chunk?;
        if page >= i64::from(range.start) && page <= i64::from(range.end) {
            return Some(PageResolution {
                local: (page - i64::from(range.start)) as u32 + 1,
                remapped: true,
            });
        }
        None
    }

    pub fn to_absolute(&self, local: u32) -> u32 {
        match self.chunk {
            Some(range) => range.start + local - 1,
            None => local,
        }
    }

    /// Prompt preamble explaining how page numbers must be reported.
    pub fn prompt_preamble(&self) -> String {
        match self.chunk {
            Some(range) => format!(
                "You are looking at {n} page images. They are pages {start}-{end} of a larger deck, \
                 but you must number them locally: the first image is page 1 and the last is page {n}. \
                 Every page reference in your answer must be a local page number between 1 and {n}.",
                n = self.page_count,
                start = range.start,
                end = range.end,
            ),
            None => format!(
                "You are looking at {n} page images, numbered 1 to {n} in the order given. \
                 Every page reference in your answer must be between 1 and {n}.",
                n = self.page_count,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_page_inside_chunk_is_remapped() {
        let mapping = PageMapping::new(10, Some(ChunkRange { start: 31, end: 40 })).unwrap();
        assert_eq!(
            mapping.resolve(37),
            Some(PageResolution {
                local: 7,
                remapped: true
            })
        );
    }

    #[test]
    fn every_absolute_offset_maps_to_local_k_plus_one() {
        let range = ChunkRange { start: 21, end: 32 };
        let mapping = PageMapping::new(range.page_span(), Some(range)).unwrap();
        for k in 0..range.page_span() {
            let resolved = mapping.resolve(i64::from(range.start + k)).unwrap();
            assert_eq!(resolved.local, k + 1);
            assert!(resolved.remapped);
            assert_eq!(mapping.to_absolute(resolved.local), range.start + k);
        }
    }

    #[test]
    fn local_numbers_win_over_absolute_interpretation() {
        let mapping = PageMapping::new(10, Some(ChunkRange { start: 5, end: 14 })).unwrap();
        assert_eq!(
            mapping.resolve(7),
            Some(PageResolution {
                local: 7,
                remapped: false
            })
        );
        assert_eq!(mapping.resolve(14).map(|r| r.local), Some(10));
    }

    #[test]
    fn out_of_range_pages_are_rejected() {
        let mapping = PageMapping::new(10, Some(ChunkRange { start: 31, end: 40 })).unwrap();
        assert_eq!(mapping.resolve(0), None);
        assert_eq!(mapping.resolve(41), None);
        assert_eq!(mapping.resolve(-3), None);
        let unchunked = PageMapping::new(10, None).unwrap();
        assert_eq!(unchunked.resolve(37), None);
    }

    #[test]
    fn chunk_must_match_page_count() {
        assert_eq!(
            PageMapping::new(9, Some(ChunkRange { start: 31, end: 40 })),
            Err(ChunkError::LengthMismatch {
                start: 31,
                end: 40,
                expected: 10,
                actual: 9
            })
        );
        assert!(matches!(
            PageMapping::new(1, Some(ChunkRange { start: 5, end: 4 })),
            Err(ChunkError::InvalidRange { .. })
        ));
    }

    #[test]
    fn preamble_mentions_local_numbering() {
        let mapping = PageMapping::new(10, Some(ChunkRange { start: 31, end: 40 })).unwrap();
        let text = mapping.prompt_preamble();
        assert!(text.contains("pages 31-40"));
        assert!(text.contains("between 1 and 10"));
    }
}
