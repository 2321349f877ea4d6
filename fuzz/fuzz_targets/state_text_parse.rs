#![no_main]

use libfuzzer_sys::fuzz_target;
use tabletop_spatial::{parse_state_text, SpatialIndex};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let parsed = parse_state_text(&raw);
    let line_count = raw.lines().count();
    assert!(parsed.grid_extent >= 1);
    assert!(parsed.diagnostics.len() <= line_count);
    assert!(parsed
        .diagnostics
        .iter()
        .all(|diagnostic| diagnostic.line_number >= 1 && diagnostic.line_number <= line_count));
    assert!(parsed.entities.iter().filter(|entity| entity.primary).count() <= 1);

    let frame = parsed.frame();
    let index = SpatialIndex::default();
    assert_eq!(index.replace_parsed(parsed), 1);
    if let Some(open) = index.nearest_open_tile(0, 0, 3, &[]) {
        assert!(frame.contains(open));
        assert!(!index.is_blocked(open.x, open.z, &[], &[]));
    }
});
