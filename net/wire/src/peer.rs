use std::{fmt::Debug, hash::Hash};

/// An identifier of a remote peer.
///
/// The transport layer owns the actual type, anything cheap to clone and hashable works.
pub trait PeerId: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> PeerId for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
