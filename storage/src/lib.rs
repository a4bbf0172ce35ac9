//! Persist protocol state and authenticate it with a Jellyfish Merkle Tree.
//!
//! # Overview
//!
//! Two layers live in this crate:
//! - [kv]: an ordered, transactional key-value [kv::Database]. Serialized transactions fail to
//!   commit if any other transaction committed after they were opened, which lets the consensus
//!   core treat "persist block, apply write set, advance committed sequence number" as one atomic
//!   step.
//! - [jmt]: a versioned 16-ary Jellyfish Merkle Tree over the application key-value state. Each
//!   committed sequence number is a tree version whose root digest is agreed upon by the
//!   committee. The tree produces inclusion, exclusion, and subrange proofs used by state sync.

pub mod jmt;
pub mod kv;
