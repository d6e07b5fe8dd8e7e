#![cfg(feature = "loom")]

use alf::ring::{Ring, RingBuilder, TransferPolicy};
use loom::sync::Arc;
use loom::thread;

#[test]
fn test_two_producers_loom() {
    loom::model(|| {
        let ring = Arc::new(Ring::<u32>::new(4).unwrap());
        let r1 = ring.clone();
        let r2 = ring.clone();

        let t1 = thread::spawn(move || {
            r1.enqueue(1).unwrap();
        });
        let t2 = thread::spawn(move || {
            r2.enqueue_bulk(&mut vec![2, 3]).unwrap();
        });
        t1.join().unwrap();
        t2.join().unwrap();

        let mut out = Vec::new();
        assert_eq!(ring.dequeue_bulk(&mut out, 3), 3);
        out.sort_unstable();
        assert_eq!(out, [1, 2, 3]);
        assert!(ring.is_empty());
    });
}

#[test]
fn test_publication_order_loom() {
    loom::model(|| {
        let ring = Arc::new(
            RingBuilder::new(4)
                .policy(TransferPolicy::Burst)
                .build::<u32>()
                .unwrap(),
        );
        let producer = ring.clone();

        let t = thread::spawn(move || {
            producer.enqueue_bulk(&mut vec![10, 20]).unwrap();
        });

        // A consumer only ever sees a published prefix, in order.
        let mut out = Vec::new();
        while out.len() < 2 {
            if ring.dequeue_bulk(&mut out, 2) == 0 {
                thread::yield_now();
            }
        }
        assert_eq!(out, [10, 20]);
        t.join().unwrap();
    });
}

#[test]
fn test_two_consumers_loom() {
    loom::model(|| {
        let ring = Arc::new(Ring::<u32>::new(4).unwrap());
        ring.enqueue_bulk(&mut vec![1, 2]).unwrap();
        let c1 = ring.clone();
        let c2 = ring.clone();

        let t1 = thread::spawn(move || c1.dequeue());
        let t2 = thread::spawn(move || c2.dequeue());
        let a = t1.join().unwrap().unwrap();
        let b = t2.join().unwrap().unwrap();

        assert_ne!(a, b);
        assert_eq!(a + b, 3);
        assert!(ring.is_empty());
    });
}
