//! Time-limited Turn credentials (TURN REST API scheme).
//!
//! `username = "{expiry}:{random}"` and
//! `credential = base64(HMAC-SHA1(secret, username))`.

use crate::models::Server;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use common::secret::ExposeSecret;
use rand::distributions::Alphanumeric;
use rand::Rng;
use ring::hmac;
use serde::Serialize;

/// Lifetime of issued credentials in seconds.
pub const CREDENTIAL_LIFETIME_SECONDS: i64 = 24 * 60 * 60;

const RANDOM_PART_LEN: usize = 16;

/// One ICE server entry as browsers expect it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Credentials for `server` valid for 24 hours from `now`.
#[must_use]
pub fn turn_credentials(server: &Server, now: DateTime<Utc>) -> IceServer {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_PART_LEN)
        .map(char::from)
        .collect();
    turn_credentials_with(
        &server.url,
        server.secret.expose_secret(),
        now.timestamp() + CREDENTIAL_LIFETIME_SECONDS,
        &random,
    )
}

/// Deterministic core of [`turn_credentials`].
#[must_use]
pub fn turn_credentials_with(host: &str, secret: &str, expiry: i64, random: &str) -> IceServer {
    let username = format!("{expiry}:{random}");
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret.as_bytes());
    let credential = STANDARD.encode(hmac::sign(&key, username.as_bytes()).as_ref());

    IceServer {
        urls: vec![
            format!("turn:{host}:443?transport=udp"),
            format!("turn:{host}:443?transport=tcp"),
            format!("turns:{host}:443?transport=tcp"),
        ],
        username,
        credential,
    }
}
