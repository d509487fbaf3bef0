//! Dirty-page bitmap scanning.
//!
//! A memory slot tracks one bit per guest page in `usize` words; bit `n` of
//! word `w` describes page `w * usize::BITS + n`. The bitmap itself belongs to
//! the memory slot, this module only reads it.

const BITS_PER_WORD: usize = usize::BITS as usize;

/// Number of words needed to track `pages` pages.
pub const fn dirty_bitmap_words(pages: usize) -> usize {
    pages.div_ceil(BITS_PER_WORD)
}

/// Size in bytes of the bitmap that tracks `pages` pages.
pub const fn dirty_bitmap_bytes(pages: usize) -> usize {
    dirty_bitmap_words(pages) * size_of::<usize>()
}

/// Returns the index of the first clear bit among the first `size` bits of
/// `bitmap`, or `size` if all of them are set.
///
/// Whole words are compared against all-ones; in the trailing partial word the
/// bits at and above `size` are forced to one before the search.
///
/// # Panics
///
/// Panics if `bitmap` holds fewer than `size` bits.
pub fn find_first_zero_bit(bitmap: &[usize], size: usize) -> usize {
    assert!(
        size <= bitmap.len() * BITS_PER_WORD,
        "bitmap of {} words cannot hold {size} bits",
        bitmap.len()
    );
    let full_words = size / BITS_PER_WORD;
    for (i, &word) in bitmap[..full_words].iter().enumerate() {
        if word != usize::MAX {
            return i * BITS_PER_WORD + word.trailing_ones() as usize;
        }
    }

    let rem = size % BITS_PER_WORD;
    if rem == 0 {
        return size;
    }
    let tail = bitmap[full_words] | (usize::MAX << rem);
    if tail == usize::MAX {
        return size;
    }
    full_words * BITS_PER_WORD + tail.trailing_ones() as usize
}

/// Read-only view of a memory slot's dirty bitmap.
#[derive(Debug, Clone, Copy)]
pub struct DirtyBitmap<'a> {
    words: &'a [usize],
    pages: usize,
}

impl<'a> DirtyBitmap<'a> {
    /// Wraps `words` as the bitmap of a slot with `pages` pages. Returns
    /// `None` if `words` is too short.
    pub fn new(words: &'a [usize], pages: usize) -> Option<Self> {
        (words.len() >= dirty_bitmap_words(pages)).then_some(Self { words, pages })
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn is_dirty(&self, page: usize) -> bool {
        page < self.pages && self.words[page / BITS_PER_WORD] & (1 << (page % BITS_PER_WORD)) != 0
    }

    /// First page not written since the last checkpoint, if any.
    pub fn first_clean_page(&self) -> Option<usize> {
        let page = find_first_zero_bit(self.words, self.pages);
        (page < self.pages).then_some(page)
    }

    /// Number of dirty pages.
    pub fn dirty_count(&self) -> usize {
        let full_words = self.pages / BITS_PER_WORD;
        let rem = self.pages % BITS_PER_WORD;
        let full: usize = self.words[..full_words]
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum();
        if rem == 0 {
            full
        } else {
            full + (self.words[full_words] & !(usize::MAX << rem)).count_ones() as usize
        }
    }
}
