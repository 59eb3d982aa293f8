//! Session factory
//!
//! Owns the extranonce1 counter. Every session gets a distinct
//! extranonce1, so two miners never search the same space.

use super::session::Session;
use crate::job::family::EXTRANONCE1_SIZE;
use crate::types::SessionId;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;

/// Creates sessions with unique extranonce1 values
#[derive(Debug)]
pub struct SessionFactory {
    next_extranonce: AtomicU32,
    initial_difficulty: f64,
    duplicate_capacity: usize,
}

impl SessionFactory {
    /// Start the counter at a random point so restarts hand out fresh values
    pub fn new(initial_difficulty: f64, duplicate_capacity: usize) -> Self {
        Self::starting_at(rand::random(), initial_difficulty, duplicate_capacity)
    }

    pub fn starting_at(start: u32, initial_difficulty: f64, duplicate_capacity: usize) -> Self {
        Self {
            next_extranonce: AtomicU32::new(start),
            initial_difficulty,
            duplicate_capacity,
        }
    }

    /// Next extranonce1, big-endian
    pub fn next_extranonce1(&self) -> [u8; EXTRANONCE1_SIZE] {
        self.next_extranonce
            .fetch_add(1, Ordering::Relaxed)
            .to_be_bytes()
    }

    pub fn initial_difficulty(&self) -> f64 {
        self.initial_difficulty
    }

    pub fn create(&self, peer: SocketAddr, outbound: mpsc::Sender<String>, now: u64) -> Session {
        Session::new(
            SessionId::new(),
            peer,
            self.next_extranonce1().to_vec(),
            self.initial_difficulty,
            self.duplicate_capacity,
            outbound,
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extranonce_sequence() {
        let factory = SessionFactory::starting_at(0xffff_fffe, 1.0, 16);
        assert_eq!(factory.next_extranonce1(), [0xff, 0xff, 0xff, 0xfe]);
        assert_eq!(factory.next_extranonce1(), [0xff, 0xff, 0xff, 0xff]);
        // Wraps instead of panicking
        assert_eq!(factory.next_extranonce1(), [0, 0, 0, 0]);
    }

    #[test]
    fn test_created_sessions_are_distinct() {
        let factory = SessionFactory::starting_at(7, 16.0, 16);
        let (tx, _rx) = mpsc::channel(4);
        let peer = "10.0.0.1:3333".parse().unwrap();
        let a = factory.create(peer, tx.clone(), 0);
        let b = factory.create(peer, tx, 0);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.extranonce1(), &[0, 0, 0, 7]);
        assert_eq!(b.extranonce1(), &[0, 0, 0, 8]);
        assert_eq!(a.difficulty(), 16.0);
        assert!(!a.is_subscribed());
    }
}
