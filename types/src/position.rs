//! Document positions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A position in a text document.
///
/// `row` is the 0-indexed line. `col` is the 0-indexed column measured in
/// UTF-16 code units, matching the wire protocol's default position encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub row: u32,
    pub col: u32,
}

impl Point {
    #[must_use]
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for Point {
    /// 1-indexed for display.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.row + 1, self.col + 1)
    }
}

/// A half-open span between two [`Point`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Range {
    pub start: Point,
    pub end: Point,
}

impl Range {
    /// Build a range, swapping the endpoints if they arrive reversed.
    #[must_use]
    pub fn new(start: Point, end: Point) -> Self {
        if end < start {
            Self {
                start: end,
                end: start,
            }
        } else {
            Self { start, end }
        }
    }

    /// A zero-width range at `point`.
    #[must_use]
    pub const fn empty(point: Point) -> Self {
        Self {
            start: point,
            end: point,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[must_use]
    pub fn contains(&self, point: Point) -> bool {
        self.start <= point && point < self.end
    }
}
