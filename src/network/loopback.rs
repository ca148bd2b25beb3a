//! In-memory paired transport for tests, demos and single-process sessions.
//!
//! [`LoopbackSocket::pair`] returns two connected sockets; whatever one sends,
//! the other receives on its next [`MessageTransport::receive_all`] call. An
//! explicit [`LinkConfig`] — threaded through the constructor, never global
//! state — adds a deterministic, seeded packet-loss model for exercising the
//! engine's retry paths.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::hash::Hash;
use std::rc::Rc;

use crate::network::messages::Message;
use crate::rng::Pcg32;
use crate::MessageTransport;

/// Simulated link behavior for a [`LoopbackSocket`]. The default is a perfect
/// link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkConfig {
    /// Probability of dropping each outbound message, in parts per thousand.
    /// 0 is a perfect link.
    pub loss_per_mille: u32,
    /// Seed for the deterministic loss model; the same seed reproduces the
    /// same drop pattern.
    pub seed: u64,
}

type Inbox<A> = Rc<RefCell<VecDeque<(A, Message)>>>;

/// One end of an in-memory message pipe.
pub struct LoopbackSocket<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    local_addr: A,
    inbox: Inbox<A>,
    peer_inbox: Inbox<A>,
    rng: Pcg32,
    config: LinkConfig,
}

impl<A> LoopbackSocket<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// Creates two connected sockets with perfect links.
    #[must_use]
    pub fn pair(addr_a: A, addr_b: A) -> (Self, Self) {
        Self::pair_with_config(addr_a, addr_b, LinkConfig::default())
    }

    /// Creates two connected sockets sharing the given link behavior.
    #[must_use]
    pub fn pair_with_config(addr_a: A, addr_b: A, config: LinkConfig) -> (Self, Self) {
        let inbox_a: Inbox<A> = Rc::new(RefCell::new(VecDeque::new()));
        let inbox_b: Inbox<A> = Rc::new(RefCell::new(VecDeque::new()));
        let socket_a = Self {
            local_addr: addr_a,
            inbox: Rc::clone(&inbox_a),
            peer_inbox: Rc::clone(&inbox_b),
            rng: Pcg32::seed_from_u64(config.seed),
            config,
        };
        let socket_b = Self {
            local_addr: addr_b,
            inbox: inbox_b,
            peer_inbox: inbox_a,
            // a different stream so both directions drop independently
            rng: Pcg32::seed_from_u64(config.seed.wrapping_add(1)),
            config,
        };
        (socket_a, socket_b)
    }
}

impl<A> MessageTransport<A> for LoopbackSocket<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    fn send_to(&mut self, msg: &Message, _addr: &A) {
        if self.config.loss_per_mille > 0
            && self.rng.next_below(1000) < self.config.loss_per_mille
        {
            return;
        }
        self.peer_inbox
            .borrow_mut()
            .push_back((self.local_addr.clone(), msg.clone()));
    }

    fn receive_all(&mut self) -> Vec<(A, Message)> {
        self.inbox.borrow_mut().drain(..).collect()
    }
}
