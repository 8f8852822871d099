//! Key material ledger guarantees, checked through the public API over a range
//! of buffer and request sizes.

#[cfg(test)]
mod tests {
    use qkdmsg::key_ledger::{KeyMaterialLedger, LedgerError};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn pattern(len: usize) -> Vec<u8> {
        // Distinct bytes per position so ranges can be located in the original
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_successive_takes_are_disjoint_and_exact() {
        for n in [1usize, 3, 16, 32, 33] {
            let buffer = pattern(1024);
            let ledger = KeyMaterialLedger::new();
            ledger.insert("bob", buffer.clone(), true).unwrap();

            let mut expected_offset = 0;
            while ledger.remaining("bob").unwrap() >= n {
                let before = ledger.remaining("bob").unwrap();
                let slice = ledger.take_next("bob", n).unwrap();

                assert_eq!(slice.offset, expected_offset, "n = {}", n);
                assert_eq!(&slice.bytes[..], &buffer[slice.offset..slice.offset + n]);
                assert_eq!(ledger.remaining("bob").unwrap(), before - n);
                expected_offset += n;
            }
        }
    }

    #[test]
    fn test_exhaustion_is_sticky_for_any_size() {
        for (size, n) in [(10usize, 11usize), (64, 65), (64, 1000)] {
            let ledger = KeyMaterialLedger::new();
            ledger.insert("bob", pattern(size), false).unwrap();

            let err = ledger.take_next("bob", n).unwrap_err();
            assert!(matches!(err, LedgerError::InsufficientMaterial { .. }));
            assert!(ledger.is_exhausted("bob").unwrap());
            assert_eq!(ledger.remaining("bob").unwrap(), 0);

            for retry in [1usize, size / 2, size] {
                assert!(matches!(
                    ledger.take_next("bob", retry),
                    Err(LedgerError::Exhausted(_))
                ));
            }
            assert!(ledger.advance("bob", 1).is_err());
        }
    }

    #[test]
    fn test_drained_entry_exhausts_on_next_take() {
        let ledger = KeyMaterialLedger::new();
        ledger.insert("bob", pattern(64), true).unwrap();
        ledger.take_next("bob", 32).unwrap();
        ledger.take_next("bob", 32).unwrap();
        assert_eq!(ledger.remaining("bob").unwrap(), 0);

        assert!(ledger.take_next("bob", 1).is_err());
        assert!(ledger.is_exhausted("bob").unwrap());
    }

    #[test]
    fn test_peers_are_independent() {
        let ledger = KeyMaterialLedger::new();
        ledger.insert("bob", pattern(32), true).unwrap();
        ledger.insert("carol", pattern(32), false).unwrap();

        assert!(ledger.take_next("bob", 64).is_err());
        assert!(ledger.is_exhausted("bob").unwrap());
        assert_eq!(ledger.take_next("carol", 32).unwrap().offset, 0);
        assert!(ledger.has_initiative("bob").unwrap());
        assert!(!ledger.has_initiative("carol").unwrap());
    }

    #[test]
    fn test_delete_then_reinsert() {
        let ledger = KeyMaterialLedger::new();
        ledger.insert("bob", pattern(8), true).unwrap();
        assert!(ledger.take_next("bob", 9).is_err());

        ledger.delete("bob").unwrap();
        assert!(matches!(
            ledger.remaining("bob"),
            Err(LedgerError::NoSuchPeer(_))
        ));

        ledger.insert("bob", pattern(16), true).unwrap();
        assert_eq!(ledger.remaining("bob").unwrap(), 16);
        assert!(!ledger.is_exhausted("bob").unwrap());
    }

    #[test]
    fn test_sender_and_receiver_stay_in_step() {
        let material = pattern(256);
        let sender = KeyMaterialLedger::new();
        let receiver = KeyMaterialLedger::new();
        sender.insert("peer", material.clone(), true).unwrap();
        receiver.insert("peer", material, false).unwrap();

        for _ in 0..4 {
            let sent = sender.take_next("peer", 32).unwrap();
            let received = receiver.consume_received("peer", 32, sent.offset).unwrap();
            assert_eq!(&sent.bytes[..], &received.bytes[..]);
        }
        assert_eq!(
            sender.remaining("peer").unwrap(),
            receiver.remaining("peer").unwrap()
        );

        // The receiver's own next send never reuses what it already consumed
        let reply = receiver.take_next("peer", 32).unwrap();
        assert_eq!(reply.offset, 128);
    }

    #[test]
    fn test_concurrent_senders_never_share_a_range() {
        let ledger = Arc::new(KeyMaterialLedger::new());
        ledger.insert("bob", pattern(32 * 1000), true).unwrap();

        let offsets: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let ledger = ledger.clone();
                    scope.spawn(move || {
                        let mut mine = Vec::new();
                        while let Ok(slice) = ledger.take_next("bob", 32) {
                            mine.push(slice.offset);
                        }
                        mine
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        assert_eq!(offsets.len(), 1000);
        let unique: HashSet<usize> = offsets.iter().copied().collect();
        assert_eq!(unique.len(), 1000);
        assert!(offsets.iter().all(|o| o % 32 == 0));
    }
}
