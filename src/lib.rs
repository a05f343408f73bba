//! A Rust implementation of privacy-preserving additive aggregation via
//! secret sharing over store-and-forward message exchange.
//!
//! N participants each hold a private numeric vector (per-category counts or
//! sums). The engine computes the element-wise sum across all participants
//! without any participant learning another's raw values: every value is
//! split into blinded fragments that only recombine to the aggregate once
//! every participant contributed.
//!
//! There is no live channel. Messages are opaque byte blobs the surrounding
//! application moves however it likes: mail attachments, file drops, manual
//! copy. The engine only tracks which messages are still owed and which have
//! arrived, and survives process restarts through session snapshots, so an
//! exchange may span days.
//!
//! ## Main Components
//!
//! * [`field`]: additive secret splitting and reconstruction in `Z_m`.
//! * [`codec`]: the self-describing, versioned wire format.
//! * [`round`]: per-round obligation tracking and lifecycle.
//! * [`session`]: the per-participant protocol driver and persistence.
//! * [`aggregate`]: reconstruction of the final vector with consistency
//!   checks.
//!
//! ## Basic Usage
//!
//! The initiator creates a study session, sends the invitation and the first
//! round of messages; peers join from the invitation. Every session then
//! imports whatever arrives and ships whatever [`session::StudySession::outbound`]
//! returns, until [`session::StudySession::current_aggregate`] succeeds.
//!
//! For in-process use (tests, examples), [`session::simulate_exchange`]
//! wires any number of sessions together:
//!
//! ```
//! use blindsum::data_types::{Participant, PrivateVector};
//! use blindsum::session::{simulate_exchange, StudyConfig};
//! use num_bigint::BigUint;
//!
//! let config = StudyConfig {
//!     name: "counts".to_string(),
//!     participants: vec![
//!         Participant::new("alice", "alice@example.com"),
//!         Participant::new("bob", "bob@example.com"),
//!         Participant::new("carol", "carol@example.com"),
//!     ],
//!     bins: vec!["A".to_string(), "B".to_string()],
//!     modulus: BigUint::from(10007u32),
//!     max_abs_value: BigUint::from(1000u32),
//!     round_deadline: None,
//! };
//! let inputs = vec![
//!     PrivateVector::from_i64(&[("A", 5), ("B", 2)]),
//!     PrivateVector::from_i64(&[("A", 3), ("B", 4)]),
//!     PrivateVector::from_i64(&[("A", 1), ("B", 1)]),
//! ];
//!
//! let results = simulate_exchange(config, inputs, &mut rand::rng())?;
//! assert_eq!(results[0].total("A"), Some(&9.into()));
//! assert_eq!(results[0].total("B"), Some(&7.into()));
//! # Ok::<(), blindsum::session::SimulateError>(())
//! ```
//!
//! ## Security Properties
//!
//! Splitting draws all but the last fragment uniformly from the field, so any
//! strict subset of fragments is statistically independent of the value it
//! blinds. What the aggregate itself reveals about individual inputs is
//! outside the engine's control and a matter of study design.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod aggregate;
pub mod codec;
pub mod data_types;
pub mod field;
pub mod round;
pub mod session;
