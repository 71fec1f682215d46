/// Mining shares module
///
/// Proof verification, share persistence and the IP ban list

pub mod validator;
pub mod storage;

pub use validator::{BoundedVerifier, Sha3Verifier, ShareKind, ShareVerifier, VerifyOutcome, VerifyRequest};
pub use storage::{BanList, RedisStorage, ShareRecord, ShareStore};
