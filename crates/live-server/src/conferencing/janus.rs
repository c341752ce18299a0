//! Janus video room credentials.

use crate::models::CallCredentials;
use rand::distributions::Alphanumeric;
use rand::Rng;

const TOKEN_LEN: usize = 32;

/// Janus room ids must fit a JavaScript number.
const MAX_ROOM_ID: u64 = (1 << 53) - 1;

/// Fresh random room id and access token.
#[must_use]
pub fn new_room_credentials() -> CallCredentials {
    let mut rng = rand::thread_rng();
    let room_id = rng.gen_range(1..=MAX_ROOM_ID);
    let token: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect();
    CallCredentials::Janus { room_id, token }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_are_random() {
        let a = new_room_credentials();
        let b = new_room_credentials();
        assert_ne!(a, b);
        match a {
            CallCredentials::Janus { room_id, token } => {
                assert!(room_id > 0 && room_id <= MAX_ROOM_ID);
                assert_eq!(token.len(), TOKEN_LEN);
            }
            CallCredentials::Bbb { .. } => unreachable!("expected janus credentials"),
        }
    }
}
