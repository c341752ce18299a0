//! Media server selection.
//!
//! Selection rules:
//! - inactive servers are never chosen
//! - servers exclusive to another world are never chosen
//! - servers exclusive to the requesting world win over shared servers
//! - `rooms_only` servers are skipped for private calls
//! - a preferred URL naming an eligible server is honoured
//! - otherwise a uniformly random server among the cheapest is chosen

use crate::models::Server;
use common::types::WorldId;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

/// What the server is chosen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPurpose {
    /// A call attached to a room.
    Room,
    /// A private call between invited users.
    Private,
}

/// Servers eligible for `world` and `purpose`, before cost is considered.
#[must_use]
pub fn eligible_servers<'a>(
    servers: &'a [Server],
    world: &WorldId,
    purpose: CallPurpose,
) -> Vec<&'a Server> {
    let usable = |s: &&Server| s.active && !(purpose == CallPurpose::Private && s.rooms_only);

    let exclusive: Vec<&Server> = servers
        .iter()
        .filter(usable)
        .filter(|s| s.world_exclusive.as_ref() == Some(world))
        .collect();
    if !exclusive.is_empty() {
        return exclusive;
    }

    servers
        .iter()
        .filter(usable)
        .filter(|s| s.world_exclusive.is_none())
        .collect()
}

/// Choose a server with the thread-local RNG.
#[must_use]
pub fn choose_server<'a>(
    servers: &'a [Server],
    world: &WorldId,
    prefer: Option<&str>,
    purpose: CallPurpose,
) -> Option<&'a Server> {
    choose_server_with(servers, world, prefer, purpose, &mut rand::thread_rng())
}

/// Choose a server with an explicit RNG.
#[must_use]
pub fn choose_server_with<'a, R: Rng + ?Sized>(
    servers: &'a [Server],
    world: &WorldId,
    prefer: Option<&str>,
    purpose: CallPurpose,
    rng: &mut R,
) -> Option<&'a Server> {
    let candidates = eligible_servers(servers, world, purpose);

    if let Some(url) = prefer {
        if let Some(server) = candidates.iter().find(|s| s.url == url) {
            return Some(*server);
        }
    }

    let min_cost = candidates.iter().map(|s| s.cost).min()?;
    let cheapest: Vec<&Server> = candidates
        .into_iter()
        .filter(|s| s.cost == min_cost)
        .collect();

    let chosen = cheapest.choose(rng).copied();
    if let Some(server) = chosen {
        debug!(
            target: "live.selector",
            world_id = %world,
            server_id = %server.id,
            cost = server.cost,
            tied = cheapest.len(),
            "Selected media server"
        );
    }
    chosen
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::ServerKind;
    use common::secret::SecretString;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::{HashMap, HashSet};
    use uuid::Uuid;

    fn server(url: &str, cost: i64) -> Server {
        Server {
            id: Uuid::new_v4(),
            kind: ServerKind::Bbb,
            url: url.to_string(),
            secret: SecretString::from("s"),
            active: true,
            world_exclusive: None,
            cost,
            rooms_only: false,
        }
    }

    fn world(slug: &str) -> WorldId {
        WorldId::new(slug)
    }

    #[test]
    fn test_exclusive_server_preferred_for_its_world() {
        let mut exclusive = server("https://excl/", 100);
        exclusive.world_exclusive = Some(world("w1"));
        let servers = vec![server("https://shared/", 0), exclusive];

        let chosen = choose_server(&servers, &world("w1"), None, CallPurpose::Room).unwrap();
        assert_eq!(chosen.url, "https://excl/");
    }

    #[test]
    fn test_exclusive_server_never_chosen_for_other_world() {
        let mut exclusive = server("https://excl/", 0);
        exclusive.world_exclusive = Some(world("w1"));
        let servers = vec![exclusive];

        assert!(choose_server(&servers, &world("w2"), None, CallPurpose::Room).is_none());
        // Not even when preferred.
        assert!(
            choose_server(&servers, &world("w2"), Some("https://excl/"), CallPurpose::Room)
                .is_none()
        );
    }

    #[test]
    fn test_inactive_never_chosen() {
        let mut inactive = server("https://off/", 0);
        inactive.active = false;
        let servers = vec![inactive, server("https://on/", 50)];

        for _ in 0..20 {
            let chosen = choose_server(&servers, &world("w"), None, CallPurpose::Room).unwrap();
            assert_eq!(chosen.url, "https://on/");
        }
        assert_eq!(
            choose_server(&servers, &world("w"), Some("https://off/"), CallPurpose::Room)
                .unwrap()
                .url,
            "https://on/"
        );
    }

    #[test]
    fn test_inactive_exclusive_falls_back_to_shared() {
        let mut exclusive = server("https://excl/", 0);
        exclusive.world_exclusive = Some(world("w1"));
        exclusive.active = false;
        let servers = vec![exclusive, server("https://shared/", 10)];

        let chosen = choose_server(&servers, &world("w1"), None, CallPurpose::Room).unwrap();
        assert_eq!(chosen.url, "https://shared/");
    }

    #[test]
    fn test_prefer_is_deterministic() {
        let servers = vec![server("https://a/", 0), server("https://b/", 500)];
        for _ in 0..20 {
            let chosen =
                choose_server(&servers, &world("w"), Some("https://b/"), CallPurpose::Room)
                    .unwrap();
            assert_eq!(chosen.url, "https://b/");
        }
    }

    #[test]
    fn test_unknown_prefer_falls_back_to_cost() {
        let servers = vec![server("https://a/", 10), server("https://b/", 5)];
        let chosen =
            choose_server(&servers, &world("w"), Some("https://gone/"), CallPurpose::Room)
                .unwrap();
        assert_eq!(chosen.url, "https://b/");
    }

    #[test]
    fn test_random_among_cheapest_only() {
        let servers = vec![
            server("https://a/", 5),
            server("https://b/", 5),
            server("https://c/", 6),
        ];
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..1000 {
            let chosen = choose_server_with(
                &servers,
                &world("w"),
                None,
                CallPurpose::Room,
                &mut rng,
            )
            .unwrap();
            *counts.entry(chosen.url.clone()).or_default() += 1;
        }

        assert!(!counts.contains_key("https://c/"));
        for url in ["https://a/", "https://b/"] {
            let share = counts.get(url).copied().unwrap_or(0);
            assert!(
                (400..=600).contains(&share),
                "{url} chosen {share} times out of 1000"
            );
        }
    }

    #[test]
    fn test_rooms_only_excluded_for_private_calls() {
        let mut rooms_only = server("https://rooms/", 0);
        rooms_only.rooms_only = true;
        let servers = vec![rooms_only, server("https://any/", 100)];

        let private = choose_server(&servers, &world("w"), None, CallPurpose::Private).unwrap();
        assert_eq!(private.url, "https://any/");
        let room = choose_server(&servers, &world("w"), None, CallPurpose::Room).unwrap();
        assert_eq!(room.url, "https://rooms/");
    }

    #[test]
    fn test_empty_pool() {
        assert!(choose_server(&[], &world("w"), None, CallPurpose::Room).is_none());
    }
}
