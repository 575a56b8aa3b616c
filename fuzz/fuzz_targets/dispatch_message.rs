#![no_main]

use hubsync_core::db::Store;
use hubsync_core::registry::{
    AggregationLevel, ConsumerRegistry, DispatchOutcome, SharedAggregationLevel,
};
use hubsync_core::transport::{STATUS_BUNDLE_MSG_TYPE, TransportMessage};
use hubsync_core::wire::MessageKind;
use libfuzzer_sys::fuzz_target;

// A redelivered message is never applied twice.
fuzz_target!(|data: &[u8]| {
    let Some((selector, payload)) = data.split_first() else {
        return;
    };
    let kind = MessageKind::ALL[usize::from(*selector) % MessageKind::ALL.len()];
    let level = if selector & 0x80 == 0 {
        AggregationLevel::Full
    } else {
        AggregationLevel::Minimal
    };
    let Ok(store) = Store::open_in_memory() else {
        return;
    };
    let registry = ConsumerRegistry::with_defaults(&SharedAggregationLevel::new(level));
    let message = TransportMessage {
        key: kind.transport_key("hub1"),
        msg_type: STATUS_BUNDLE_MSG_TYPE.to_string(),
        version: String::new(),
        payload: payload.to_vec(),
    };

    let first = registry.dispatch(&message, &store);
    let second = registry.dispatch(&message, &store);
    if let (Ok(first), Ok(second)) = (first, second) {
        if matches!(first, DispatchOutcome::Merged(o) if o.is_applied()) {
            assert!(
                !matches!(second, DispatchOutcome::Merged(o) if o.is_applied()),
                "redelivery applied twice"
            );
        }
    }
});
