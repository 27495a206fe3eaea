use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::protocol::Level;

/// Category flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CategoryFlags(u8);

impl CategoryFlags {
    pub const NONE: CategoryFlags = CategoryFlags(0);
    /// Messages of the category are delivered.
    pub const ENABLED: CategoryFlags = CategoryFlags(0x01);
    /// Set once at creation when the category started out enabled.
    pub const ENABLED_BY_DEFAULT: CategoryFlags = CategoryFlags(0x02);
    /// Viewers should not display the category name.
    pub const HIDE_NAME: CategoryFlags = CategoryFlags(0x04);
    pub const MASK: CategoryFlags = CategoryFlags(0x07);

    pub const fn from_bits_truncate(bits: u8) -> Self {
        CategoryFlags(bits & Self::MASK.0)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: CategoryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: CategoryFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for CategoryFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        CategoryFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for CategoryFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for CategoryFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        CategoryFlags(self.0 & rhs.0)
    }
}

impl Not for CategoryFlags {
    type Output = Self;
    fn not(self) -> Self {
        CategoryFlags(!self.0 & Self::MASK.0)
    }
}

impl fmt::Debug for CategoryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::ENABLED) {
            names.push("ENABLED");
        }
        if self.contains(Self::ENABLED_BY_DEFAULT) {
            names.push("ENABLED_BY_DEFAULT");
        }
        if self.contains(Self::HIDE_NAME) {
            names.push("HIDE_NAME");
        }
        write!(f, "CategoryFlags({})", names.join(" | "))
    }
}

/// A named log category.
///
/// Id and name never change. Level and flags are stored in atomics so every
/// holder of an `Arc<Category>` sees changes made through the
/// [`Core`](crate::core::Core) without locking. Only the core mutates them.
pub struct Category {
    id: u32,
    name: String,
    level: AtomicU8,
    flags: AtomicU8,
}

impl Category {
    pub(crate) fn new(id: u32, name: &str, level: Level, flags: CategoryFlags) -> Self {
        let mut flags = CategoryFlags::from_bits_truncate(flags.bits());
        if flags.contains(CategoryFlags::ENABLED) {
            flags |= CategoryFlags::ENABLED_BY_DEFAULT;
        }
        Self {
            id,
            name: name.to_string(),
            level: AtomicU8::new(level.as_u8()),
            flags: AtomicU8::new(flags.bits()),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Level override, `Undefined` when the core default applies.
    pub fn level(&self) -> Level {
        Level::from_u8(self.level.load(Ordering::Acquire)).unwrap_or(Level::Undefined)
    }

    pub fn flags(&self) -> CategoryFlags {
        CategoryFlags(self.flags.load(Ordering::Acquire))
    }

    pub fn is_enabled(&self) -> bool {
        self.flags().contains(CategoryFlags::ENABLED)
    }

    /// Stores a new level, returning the previous one.
    pub(crate) fn swap_level(&self, level: Level) -> Level {
        Level::from_u8(self.level.swap(level.as_u8(), Ordering::AcqRel)).unwrap_or(Level::Undefined)
    }

    /// Sets or clears the ENABLED bit. Returns the bits that changed.
    pub(crate) fn set_enabled(&self, enabled: bool) -> CategoryFlags {
        let bit = CategoryFlags::ENABLED.bits();
        let old = if enabled {
            self.flags.fetch_or(bit, Ordering::AcqRel)
        } else {
            self.flags.fetch_and(!bit, Ordering::AcqRel)
        };
        let new = if enabled { old | bit } else { old & !bit };
        CategoryFlags(old ^ new)
    }
}

impl fmt::Debug for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Category")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("level", &self.level())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Sorts a category list by name.
pub fn sort_by_name(categories: &mut [Arc<Category>]) {
    categories.sort_by(|a, b| a.name().cmp(b.name()));
}

/// Shell-style wildcard match: `*` matches any run of characters, `?`
/// matches exactly one.
///
/// # Examples
///
/// ```
/// # use logstream::category::glob_match;
/// assert!(glob_match("net.*", "net.tcp"));
/// assert!(glob_match("d?sk", "disk"));
/// assert!(!glob_match("net.*", "disk"));
/// ```
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    // Position of the last '*' seen and the text position it was tried at
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, at)) = backtrack {
            p = star + 1;
            t = at + 1;
            backtrack = Some((star, at + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_implies_enabled_by_default() {
        let cat = Category::new(1, "a", Level::Undefined, CategoryFlags::ENABLED);
        assert!(cat.flags().contains(CategoryFlags::ENABLED_BY_DEFAULT));

        let cat = Category::new(2, "b", Level::Undefined, CategoryFlags::ENABLED_BY_DEFAULT);
        assert_eq!(cat.flags(), CategoryFlags::ENABLED_BY_DEFAULT);

        let cat = Category::new(4, "d", Level::Undefined, CategoryFlags::HIDE_NAME);
        assert!(!cat.flags().contains(CategoryFlags::ENABLED_BY_DEFAULT));

        let cat = Category::new(3, "c", Level::Undefined, CategoryFlags::from_bits_truncate(0xff));
        assert_eq!(cat.flags(), CategoryFlags::MASK);
    }

    #[test]
    fn test_set_enabled_reports_changes() {
        let cat = Category::new(1, "a", Level::Undefined, CategoryFlags::NONE);
        assert_eq!(cat.set_enabled(true), CategoryFlags::ENABLED);
        assert_eq!(cat.set_enabled(true), CategoryFlags::NONE);
        assert_eq!(cat.set_enabled(false), CategoryFlags::ENABLED);
        assert!(!cat.is_enabled());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(glob_match("a*c", "abcbc"));
        assert!(!glob_match("a*c", "abcb"));
        assert!(glob_match("??", "ab"));
        assert!(!glob_match("??", "abc"));
        assert!(glob_match("héllo*", "héllo wörld"));
        assert!(!glob_match("", "x"));
    }
}
