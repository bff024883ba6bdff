//! Challenge-response digests for the router login.
//!
//! The router hands out either a legacy challenge (plain nonce, answered
//! with an MD5 over UTF-16LE text) or a versioned `2$iter1$salt1$iter2$salt2`
//! challenge answered with two chained PBKDF2-HMAC-SHA256 rounds.

use std::str::FromStr;

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;
use thiserror::Error;

use crate::error::DeviceError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("empty challenge")]
    Empty,
    #[error("expected 5 '$'-separated fields, got {0}")]
    FieldCount(usize),
    #[error("invalid iteration count {0:?}")]
    Iterations(String),
    #[error("invalid hex salt {0:?}")]
    Salt(String),
}

impl From<ChallengeError> for DeviceError {
    fn from(err: ChallengeError) -> Self {
        DeviceError::Protocol(format!("malformed challenge: {err}"))
    }
}

/// A login challenge, classified once when the SessionInfo is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Legacy(String),
    Versioned(VersionedChallenge),
}

/// Parameters of the two-round challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedChallenge {
    pub iter1: u32,
    pub salt1: Vec<u8>,
    pub iter2: u32,
    pub salt2: Vec<u8>,
    /// `salt2` exactly as the router sent it; echoed back in the response.
    salt2_hex: String,
}

impl FromStr for Challenge {
    type Err = ChallengeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ChallengeError::Empty);
        }
        if !s.contains('$') {
            return Ok(Challenge::Legacy(s.to_string()));
        }

        let parts: Vec<&str> = s.split('$').collect();
        let [_version, iter1, salt1, iter2, salt2] = parts.as_slice() else {
            return Err(ChallengeError::FieldCount(parts.len()));
        };

        Ok(Challenge::Versioned(VersionedChallenge {
            iter1: parse_iterations(iter1)?,
            salt1: parse_salt(salt1)?,
            iter2: parse_iterations(iter2)?,
            salt2: parse_salt(salt2)?,
            salt2_hex: salt2.to_string(),
        }))
    }
}

impl Challenge {
    /// Computes the `response` query value proving knowledge of `secret`.
    pub fn solve(&self, secret: &str) -> String {
        match self {
            Challenge::Legacy(nonce) => solve_legacy(nonce, secret),
            Challenge::Versioned(versioned) => versioned.solve(secret),
        }
    }
}

impl VersionedChallenge {
    fn solve(&self, secret: &str) -> String {
        let hash1 = pbkdf2_block(secret.as_bytes(), &self.salt1, self.iter1);
        let hash2 = pbkdf2_block(&hash1, &self.salt2, self.iter2);
        format!("{}${}", self.salt2_hex, hex::encode(hash2))
    }
}

/// Parses `challenge` and solves it in one go.
pub fn solve(challenge: &str, secret: &str) -> Result<String, ChallengeError> {
    Ok(challenge.parse::<Challenge>()?.solve(secret))
}

fn parse_iterations(field: &str) -> Result<u32, ChallengeError> {
    match field.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ChallengeError::Iterations(field.to_string())),
    }
}

fn parse_salt(field: &str) -> Result<Vec<u8>, ChallengeError> {
    hex::decode(field).map_err(|_| ChallengeError::Salt(field.to_string()))
}

/// First output block of PBKDF2-HMAC-SHA256: salt || INT(1), iterated and XOR-folded.
fn pbkdf2_block(key: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");

    let mut block = Vec::with_capacity(salt.len() + 4);
    block.extend_from_slice(salt);
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut folded = [0u8; 32];
    for _ in 0..iterations {
        let mut round = mac.clone();
        round.update(&block);
        block = round.finalize().into_bytes().to_vec();

        for (acc, byte) in folded.iter_mut().zip(&block) {
            *acc ^= byte;
        }
    }
    folded
}

fn solve_legacy(nonce: &str, secret: &str) -> String {
    let text = format!("{nonce}-{secret}");
    let utf16le: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
    format!("{nonce}-{}", hex::encode(Md5::digest(&utf16le)))
}
