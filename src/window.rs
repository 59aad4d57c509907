//! Windowed rendering for long, variable-height message lists.
//!
//! Heights are learned after layout and kept in a [`HeightCache`] bound to one
//! list identity. Unmeasured items fall back to a constant estimate. Units are
//! whatever the caller measures in; the terminal front end uses rows.

use std::collections::HashMap;

/// Lists at or below this length are rendered in full.
pub const DEFAULT_THRESHOLD: usize = 50;
pub const DEFAULT_OVERSCAN: usize = 5;
pub const DEFAULT_ESTIMATED_HEIGHT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    pub threshold: usize,
    pub overscan: usize,
    pub estimated_height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            overscan: DEFAULT_OVERSCAN,
            estimated_height: DEFAULT_ESTIMATED_HEIGHT,
        }
    }
}

/// Inclusive index range to render, positioned `offset_pixels` from the top of
/// a scroll area `total_pixels` tall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderWindow {
    pub start_index: usize,
    pub end_index: usize,
    pub offset_pixels: u64,
    pub total_pixels: u64,
}

impl RenderWindow {
    pub fn indices(&self) -> std::ops::RangeInclusive<usize> {
        self.start_index..=self.end_index
    }
}

/// Measured heights by item index, valid for a single list identity.
#[derive(Debug, Default, Clone)]
pub struct HeightCache {
    list_id: Option<String>,
    heights: HashMap<usize, u32>,
}

impl HeightCache {
    /// Binds the cache to `list_id`. Returns true when this discarded
    /// measurements taken for a different list.
    pub fn bind(&mut self, list_id: &str) -> bool {
        if self.list_id.as_deref() == Some(list_id) {
            return false;
        }
        let had_entries = !self.heights.is_empty();
        self.heights.clear();
        self.list_id = Some(list_id.to_string());
        tracing::debug!(list = list_id, "height cache rebound");
        had_entries
    }

    pub fn list_id(&self) -> Option<&str> {
        self.list_id.as_deref()
    }

    pub fn record(&mut self, index: usize, height: u32) {
        self.heights.insert(index, height);
    }

    pub fn get(&self, index: usize) -> Option<u32> {
        self.heights.get(&index).copied()
    }

    pub fn height_or(&self, index: usize, estimate: u32) -> u32 {
        self.get(index).unwrap_or(estimate)
    }

    /// Forgets measurements at or past `len`, e.g. after the list shrank.
    pub fn truncate(&mut self, len: usize) {
        self.heights.retain(|i, _| *i < len);
    }

    pub fn len(&self) -> usize {
        self.heights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heights.is_empty()
    }
}

/// Computes the slice of a `len`-item list to render. `None` for an empty list.
pub fn compute_window(
    len: usize,
    scroll_top: u64,
    container_height: u64,
    cache: &HeightCache,
    config: &WindowConfig,
) -> Option<RenderWindow> {
    if len == 0 {
        return None;
    }
    let est = config.estimated_height;
    let h = |i: usize| u64::from(cache.height_or(i, est));
    let total_pixels: u64 = (0..len).map(h).sum();

    if len <= config.threshold {
        return Some(RenderWindow {
            start_index: 0,
            end_index: len - 1,
            offset_pixels: 0,
            total_pixels,
        });
    }

    // First item whose bottom edge lies below the scroll offset.
    let mut bottom = 0u64;
    let mut first = len - 1;
    for i in 0..len {
        bottom += h(i);
        if bottom > scroll_top {
            first = i;
            break;
        }
    }
    let start_index = first.saturating_sub(config.overscan);

    let limit = scroll_top
        .saturating_add(container_height)
        .saturating_add((config.overscan as u64).saturating_mul(u64::from(est)));
    let mut end_index = first;
    while bottom <= limit && end_index + 1 < len {
        end_index += 1;
        bottom += h(end_index);
    }

    let offset_pixels = (0..start_index).map(h).sum();
    Some(RenderWindow {
        start_index,
        end_index,
        offset_pixels,
        total_pixels,
    })
}

/// Rows `text` occupies when wrapped at `width` columns, plus one separator row.
pub fn measure_rows(text: &str, width: u16) -> u32 {
    let width = usize::from(width.max(1));
    let body: usize = text
        .lines()
        .map(|line| line.chars().count().div_ceil(width).max(1))
        .sum();
    (body.max(1) + 1) as u32
}

/// The single windowed view over the active conversation. The live streaming
/// buffer, when present, is rendered as one extra trailing item.
#[derive(Debug, Default)]
pub struct ChatView {
    config: WindowConfig,
    cache: HeightCache,
}

impl ChatView {
    pub fn new(config: WindowConfig) -> Self {
        Self { config, cache: HeightCache::default() }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn cache(&self) -> &HeightCache {
        &self.cache
    }

    pub fn bind(&mut self, list_id: &str) -> bool {
        self.cache.bind(list_id)
    }

    pub fn record_height(&mut self, index: usize, height: u32) {
        self.cache.record(index, height);
    }

    pub fn window(&self, len: usize, scroll_top: u64, container_height: u64) -> Option<RenderWindow> {
        compute_window(len, scroll_top, container_height, &self.cache, &self.config)
    }

    /// Lays out `items` for a viewport, measuring what gets rendered and
    /// re-windowing until the range settles on measured heights.
    pub fn layout(
        &mut self,
        items: &[&str],
        width: u16,
        scroll_top: u64,
        container_height: u64,
    ) -> Option<RenderWindow> {
        self.cache.truncate(items.len());
        let mut current = self.window(items.len(), scroll_top, container_height)?;
        for _ in 0..4 {
            for i in current.indices() {
                self.cache.record(i, measure_rows(items[i], width));
            }
            let next = self.window(items.len(), scroll_top, container_height)?;
            if next == current {
                break;
            }
            current = next;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(est: u32) -> WindowConfig {
        WindowConfig { threshold: 50, overscan: 5, estimated_height: est }
    }

    #[test]
    fn short_list_renders_everything() {
        let cache = HeightCache::default();
        let w = compute_window(50, 10_000, 100, &cache, &cfg(3)).unwrap();
        assert_eq!((w.start_index, w.end_index, w.offset_pixels), (0, 49, 0));
        assert_eq!(w.total_pixels, 150);
    }

    #[test]
    fn empty_list_has_no_window() {
        assert!(compute_window(0, 0, 100, &HeightCache::default(), &cfg(3)).is_none());
    }

    #[test]
    fn fixed_height_window_matches_hand_computation() {
        // first visible = 1000 / 50 = 20, start = 15;
        // limit = 1000 + 500 + 250 = 1750, item 35 has bottom 1800.
        let w = compute_window(200, 1000, 500, &HeightCache::default(), &cfg(50)).unwrap();
        assert_eq!(w.start_index, 15);
        assert_eq!(w.end_index, 35);
        assert_eq!(w.offset_pixels, 750);
        assert_eq!(w.total_pixels, 10_000);
    }

    #[test]
    fn window_clamps_at_both_ends() {
        let top = compute_window(200, 0, 500, &HeightCache::default(), &cfg(50)).unwrap();
        assert_eq!(top.start_index, 0);
        let bottom = compute_window(200, 50_000, 500, &HeightCache::default(), &cfg(50)).unwrap();
        assert_eq!(bottom.end_index, 199);
        assert_eq!(bottom.start_index, 194);
    }

    #[test]
    fn measured_heights_shift_the_window() {
        let mut cache = HeightCache::default();
        for i in 0..10 {
            cache.record(i, 200);
        }
        // items 0..10 span 2000, so scroll 1000 is inside item 5
        let w = compute_window(100, 1000, 100, &cache, &cfg(10)).unwrap();
        assert_eq!(w.start_index, 0);
        assert_eq!(w.end_index, 5);
        assert_eq!(w.total_pixels, 2000 + 90 * 10);
    }

    #[test]
    fn rebinding_discards_measurements() {
        let mut cache = HeightCache::default();
        assert!(!cache.bind("a"));
        cache.record(5, 40);
        assert!(!cache.bind("a"));
        assert_eq!(cache.get(5), Some(40));
        assert!(cache.bind("b"));
        assert_eq!(cache.get(5), None);
        assert_eq!(cache.height_or(5, 3), 3);
        assert_eq!(cache.list_id(), Some("b"));
    }

    #[test]
    fn measure_rows_wraps_lines() {
        assert_eq!(measure_rows("", 80), 2);
        assert_eq!(measure_rows("short", 80), 2);
        assert_eq!(measure_rows(&"x".repeat(81), 80), 3);
        assert_eq!(measure_rows("a\n\nb", 80), 4);
    }

    #[test]
    fn huge_scroll_offset_clamps_to_the_end() {
        let w = compute_window(200, u64::MAX, 40, &HeightCache::default(), &cfg(40)).unwrap();
        assert_eq!((w.start_index, w.end_index), (194, 199));
        let w = compute_window(200, u64::MAX - 10, u64::MAX, &HeightCache::default(), &cfg(40)).unwrap();
        assert_eq!(w.end_index, 199);
    }

    #[test]
    fn layout_forgets_heights_past_a_shrunk_list() {
        let items: Vec<&str> = vec!["row"; 80];
        let mut view = ChatView::new(cfg(3));
        view.bind("c1");
        view.record_height(70, 9);
        view.layout(&items[..60], 80, 0, 24).unwrap();
        assert_eq!(view.cache().get(70), None);
        assert!(view.cache().len() <= 60);
    }

    #[test]
    fn layout_settles_on_measured_heights() {
        let long = "y".repeat(400);
        let items: Vec<&str> = (0..120).map(|i| if i % 2 == 0 { "hi" } else { long.as_str() }).collect();
        let mut view = ChatView::new(cfg(3));
        view.bind("c1");
        let w = view.layout(&items, 80, 0, 24).unwrap();
        for i in w.indices() {
            assert!(view.cache().get(i).is_some());
        }
        assert_eq!(view.window(items.len(), 0, 24), Some(w));
    }
}
