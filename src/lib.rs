//! ECDSA keep client.
//!
//! A keep is a signing group created on-chain and authorized to hold a
//! threshold ECDSA key. This crate implements the client daemon run by a
//! single operator: it watches the chain for keep lifecycle events, runs key
//! generation for keeps the operator is a member of, produces signatures on
//! demand, and retires keeps once the chain confirms they are closed or
//! terminated.
//!
//! The cryptographic protocol and the peer-to-peer transport live behind the
//! [`tecdsa::SigningProtocol`] trait; the chain and the on-disk signer store
//! are consumed through [`chain::KeepChain`] and
//! [`persistence::PersistenceHandle`].

pub mod chain;
pub mod client;
pub mod config;
pub mod confirmation;
pub mod deployment;
pub mod error;
pub mod event;
pub mod persistence;
pub mod registry;
pub mod retry;
pub mod supervisor;
pub mod tecdsa;

#[cfg(test)]
pub(crate) mod testutil;
