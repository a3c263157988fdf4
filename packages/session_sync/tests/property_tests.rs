use proptest::prelude::*;
use uuid::Uuid;

use session_sync::{Envelope, ParticipantId, SaveId, SharedRecord, Stamp, SyncMessage};

// --- Convergence under reordered delivery ---

#[derive(Clone, Debug)]
struct Write {
    origin: u8,
    welcome: bool,
    value: String,
}

fn arb_write() -> impl Strategy<Value = Write> {
    (0u8..3, any::<bool>(), "[a-z]{1,6}").prop_map(|(origin, welcome, value)| Write {
        origin,
        welcome,
        value,
    })
}

fn participant(origin: u8) -> ParticipantId {
    ParticipantId(Uuid::from_u128(u128::from(origin) + 1))
}

/// Replay `writes` as local edits on three replicas, collecting the stamped
/// envelopes each edit would ship.
fn stamped_envelopes(save_id: SaveId, writes: &[Write]) -> Vec<Envelope> {
    let mut replicas: Vec<SharedRecord> = (0..3).map(|_| SharedRecord::new(save_id, "")).collect();
    let mut out = Vec::new();
    for write in writes {
        let origin = participant(write.origin);
        let replica = &mut replicas[usize::from(write.origin)];
        let envelope = if write.welcome {
            let stamp = replica.set_welcome_local(write.value.clone(), origin);
            Envelope::stamped(
                SyncMessage::WelcomeParticipant {
                    welcome_message: write.value.clone(),
                },
                stamp,
            )
        } else {
            let stamp = replica.set_file_local(write.value.clone(), origin);
            Envelope::stamped(
                SyncMessage::Update {
                    file: write.value.clone(),
                },
                stamp,
            )
        };
        // Every replica sees the edit before the next one is made.
        for other in replicas.iter_mut() {
            other.apply(&envelope.message, envelope.stamp);
        }
        out.push(envelope);
    }
    out
}

fn replay(save_id: SaveId, envelopes: &[Envelope]) -> SharedRecord {
    let mut record = SharedRecord::new(save_id, "");
    for envelope in envelopes {
        record.apply(&envelope.message, envelope.stamp);
    }
    record
}

fn arb_history() -> impl Strategy<Value = (Vec<Envelope>, Vec<Envelope>)> {
    let save_id = SaveId(Uuid::from_u128(42));
    prop::collection::vec(arb_write(), 1..20).prop_flat_map(move |writes| {
        let envelopes = stamped_envelopes(save_id, &writes);
        (Just(envelopes.clone()), Just(envelopes).prop_shuffle())
    })
}

proptest! {
    #[test]
    fn delivery_order_does_not_change_the_outcome((in_order, shuffled) in arb_history()) {
        let save_id = SaveId(Uuid::from_u128(42));
        let a = replay(save_id, &in_order);
        let b = replay(save_id, &shuffled);
        prop_assert_eq!(&a.file, &b.file);
        prop_assert_eq!(&a.welcome_message, &b.welcome_message);
        prop_assert_eq!(a.file_stamp(), b.file_stamp());
        prop_assert_eq!(a.welcome_stamp(), b.welcome_stamp());
    }

    #[test]
    fn newest_stamp_wins((in_order, shuffled) in arb_history()) {
        let save_id = SaveId(Uuid::from_u128(42));
        let record = replay(save_id, &shuffled);

        let newest = |welcome: bool| {
            in_order
                .iter()
                .filter(|e| matches!(e.message, SyncMessage::WelcomeParticipant { .. }) == welcome)
                .max_by_key(|e| e.stamp)
                .cloned()
        };
        if let Some(envelope) = newest(false) {
            prop_assert_eq!(record.file_stamp(), envelope.stamp);
        }
        if let Some(envelope) = newest(true) {
            prop_assert_eq!(record.welcome_stamp(), envelope.stamp);
        }
    }

    #[test]
    fn causally_ordered_edits_get_increasing_stamps(writes in prop::collection::vec(arb_write(), 1..20)) {
        let envelopes = stamped_envelopes(SaveId::new(), &writes);
        let stamps: Vec<Stamp> = envelopes.iter().filter_map(|e| e.stamp).collect();
        for pair in stamps.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
    }
}
