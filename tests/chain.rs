//! End-to-end buffer chain behavior
//!
//! Exercises chains through the public API only: interleaved stream
//! traffic checked against a shadow model, datagram sequences, peek/read
//! equivalence, and page accounting across full fill/drain cycles.

use std::collections::VecDeque;

use bufchain::{BufChain, ChainError, HeapPages, PageAllocator, CELL_PAYLOAD, CHAIN_CAPACITY};

/// Tiny deterministic generator so failures are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}

#[test]
fn stream_interleaved_matches_model() {
    let pages = HeapPages::new();
    let mut chain = BufChain::new(&pages);
    let mut model: VecDeque<u8> = VecDeque::new();
    let mut rng = Lcg(7);

    let mut written = 0usize;
    let mut read = 0usize;

    for _ in 0..400 {
        if rng.below(2) == 0 {
            let want = rng.below(3 * CELL_PAYLOAD) + 1;
            let data: Vec<u8> = (0..want).map(|i| ((written + i) % 251) as u8).collect();
            match chain.write_stream(&data[..], want) {
                Ok(n) => {
                    assert!(n > 0 && n <= want);
                    model.extend(&data[..n]);
                    written += n;
                }
                Err(ChainError::ShouldWait) => assert!(chain.is_full()),
                Err(e) => panic!("unexpected write error: {e:?}"),
            }
        } else {
            let want = rng.below(2 * CELL_PAYLOAD) + 1;
            let mut out = vec![0u8; want];
            let n = chain
                .read(&mut out[..], want, false)
                .expect("stream read failed");
            let expect: Vec<u8> = model.drain(..n).collect();
            assert_eq!(out[..n], expect[..]);
            read += n;
        }

        // Admitted bytes are conserved and the bound always holds.
        assert_eq!(chain.size(false), written - read);
        assert!(chain.size(false) <= CHAIN_CAPACITY);
    }

    drop(chain);
    assert_eq!(pages.outstanding(), 0);
}

#[test]
fn datagram_sequence_preserves_frames() {
    let pages = HeapPages::new();
    let mut chain = BufChain::new(&pages);
    let mut rng = Lcg(3);
    let mut frames: VecDeque<Vec<u8>> = VecDeque::new();

    fn drain_front<A: PageAllocator>(chain: &mut BufChain<A>, frames: &mut VecDeque<Vec<u8>>) {
        let expect = frames.pop_front().expect("model out of frames");
        let mut out = vec![0u8; expect.len()];
        let out_len = out.len();
        assert_eq!(chain.read(&mut out[..], out_len, true), Ok(expect.len()));
        assert_eq!(out, expect);
    }

    for i in 0..200usize {
        let len = rng.below(2 * CELL_PAYLOAD) + 1;
        let data: Vec<u8> = (0..len).map(|j| ((i * 37 + j) % 253) as u8).collect();

        // Make room the way a dispatcher would: drain oldest frames first.
        while chain.size(false) + len > CHAIN_CAPACITY {
            drain_front(&mut chain, &mut frames);
        }

        assert_eq!(chain.write_datagram(&data[..], len), Ok(len));
        frames.push_back(data);

        let front_len = frames.front().map_or(0, |f| f.len());
        assert_eq!(chain.size(true), front_len);
    }

    while !frames.is_empty() {
        drain_front(&mut chain, &mut frames);
    }
    assert!(chain.is_empty());
    drop(chain);
    assert_eq!(pages.outstanding(), 0);
}

#[test]
fn peek_previews_exactly_what_read_delivers() {
    let pages = HeapPages::new();
    let mut chain = BufChain::new(&pages);
    let data: Vec<u8> = (0..2 * CELL_PAYLOAD + 500).map(|i| (i % 241) as u8).collect();
    assert_eq!(chain.write_stream(&data[..], data.len()), Ok(data.len()));

    let mut rng = Lcg(11);
    let mut delivered = Vec::new();
    while !chain.is_empty() {
        let want = rng.below(CELL_PAYLOAD) + 1;
        let mut peeked = vec![0u8; want];
        let peeked_n = chain
            .peek(&mut peeked[..], want, false)
            .expect("peek failed");

        let mut out = vec![0u8; want];
        let read_n = chain.read(&mut out[..], want, false).expect("read failed");

        assert_eq!(peeked_n, read_n);
        assert_eq!(peeked[..peeked_n], out[..read_n]);
        delivered.extend_from_slice(&out[..read_n]);
    }

    assert_eq!(delivered, data);
    drop(chain);
    assert_eq!(pages.outstanding(), 0);
}

#[test]
fn truncated_datagram_read_discards_remainder() {
    let pages = HeapPages::new();
    let mut chain = BufChain::new(&pages);
    let big: Vec<u8> = (0..CELL_PAYLOAD + 200).map(|i| (i % 199) as u8).collect();

    assert_eq!(chain.write_datagram(&big[..], big.len()), Ok(big.len()));
    assert_eq!(chain.write_datagram(b"next".as_slice(), 4), Ok(4));

    let mut out = vec![0u8; 16];
    assert_eq!(chain.read(&mut out[..], 16, true), Ok(16));
    assert_eq!(out[..], big[..16]);

    // The rest of the first datagram is gone; the second is intact.
    assert_eq!(chain.size(true), 4);
    let mut out = vec![0u8; 4];
    assert_eq!(chain.read(&mut out[..], 4, true), Ok(4));
    assert_eq!(&out, b"next");
    assert!(chain.is_empty());
}

#[test]
fn fill_drain_cycles_leak_nothing() {
    let pages = HeapPages::new();
    let mut chain = BufChain::new(&pages);
    let data: Vec<u8> = (0..CHAIN_CAPACITY).map(|i| (i % 239) as u8).collect();

    for _ in 0..3 {
        assert_eq!(chain.write_stream(&data[..], data.len()), Ok(CHAIN_CAPACITY));
        assert!(chain.is_full());

        let mut out = vec![0u8; CHAIN_CAPACITY];
        assert_eq!(
            chain.read(&mut out[..], CHAIN_CAPACITY, false),
            Ok(CHAIN_CAPACITY)
        );
        assert_eq!(out, data);
        assert!(chain.is_empty());
        assert_eq!(pages.outstanding(), 0);
    }
}
