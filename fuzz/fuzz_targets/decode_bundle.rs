#![no_main]

use hubsync_core::merge::StatusBundle;
use hubsync_core::wire::MessageKind;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((selector, payload)) = data.split_first() else {
        return;
    };
    let kind = MessageKind::ALL[usize::from(*selector) % MessageKind::ALL.len()];
    if let Ok(bundle) = StatusBundle::decode(kind, payload) {
        assert_eq!(bundle.kind(), kind);
    }
});
