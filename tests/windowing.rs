use std::time::Duration;

use rusty_chat::conversation::ConversationRegistry;
use rusty_chat::providers::ChatMessage;
use rusty_chat::window::{HeightCache, WindowConfig, compute_window};

const ITEM: u64 = 40;

fn config() -> WindowConfig {
    WindowConfig { threshold: 50, overscan: 5, estimated_height: ITEM as u32 }
}

#[test]
fn fixed_height_list_renders_contiguous_covering_range() {
    let cache = HeightCache::default();
    let cfg = config();
    let container = 600;
    let total = 200 * ITEM;

    for scroll in (0..=total + 400).step_by(7) {
        let w = compute_window(200, scroll, container, &cache, &cfg).unwrap();
        assert!(w.start_index <= w.end_index, "scroll {scroll}");
        assert!(w.end_index <= 199, "scroll {scroll}");

        let first_visible = (scroll / ITEM).min(199) as usize;
        let last_visible = ((scroll + container) / ITEM).min(199) as usize;
        assert_eq!(w.start_index, first_visible.saturating_sub(5), "scroll {scroll}");
        assert!(w.end_index >= last_visible, "scroll {scroll}");

        let limit = scroll + container + 5 * ITEM;
        let expected_end = (limit / ITEM).min(199) as usize;
        assert_eq!(w.end_index, expected_end, "scroll {scroll}");

        assert_eq!(w.offset_pixels, w.start_index as u64 * ITEM);
        assert_eq!(w.total_pixels, total);
    }
}

#[test]
fn list_at_threshold_is_not_windowed() {
    let w = compute_window(50, 1_000, 100, &HeightCache::default(), &config()).unwrap();
    assert_eq!(w.indices(), 0..=49);
    let w = compute_window(51, 1_000, 100, &HeightCache::default(), &config()).unwrap();
    assert!(w.start_index > 0);
}

#[test]
fn switching_conversation_never_reuses_heights() {
    let mut reg = ConversationRegistry::new(config(), Duration::from_millis(300));
    let a = reg.switch_to("a");
    a.messages = (0..120).map(|i| ChatMessage::user(format!("a{i}"))).collect();
    reg.view_mut().record_height(5, 400);
    let in_a = reg.view().window(120, 0, 200).unwrap();

    let b = reg.switch_to("b");
    b.messages = (0..120).map(|i| ChatMessage::user(format!("b{i}"))).collect();
    assert_eq!(reg.view().cache().get(5), None);
    let in_b = reg.view().window(120, 0, 200).unwrap();

    assert_eq!(in_a.total_pixels, 119 * ITEM + 400);
    assert_eq!(in_b.total_pixels, 120 * ITEM);
    assert_ne!(in_a, in_b);

    // back to "a": its old measurement is gone too and must be remeasured
    reg.switch_to("a");
    assert_eq!(reg.view().cache().get(5), None);
}
