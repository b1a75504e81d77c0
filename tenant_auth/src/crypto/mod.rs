//! One-way hashing and random material for credentials.

pub mod hasher;
pub mod random;

pub use hasher::CredentialHasher;
