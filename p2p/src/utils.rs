//! Utilities shared by components that fetch data from peers.

pub mod requester;
