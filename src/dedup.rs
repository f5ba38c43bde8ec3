//! Selection of genuinely new posts for an account.
//!
//! Posts are compared by numeric id against the account's high-water mark.
//! The first observation of an account yields at most one post, so adding
//! an account never floods the chat with its history. Pinned posts are
//! remembered but never delivered and never move the mark.

use crate::account::AccountPollState;
use crate::post::Post;
use tracing::{debug, info};

/// Result of one dedup pass
#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// New posts, highest id first
    pub new_posts: Vec<Post>,

    /// Whether `last_seen_id` moved and needs persisting
    pub high_water_changed: bool,
}

/// Compute the new subset of `posts` and update `state` accordingly.
pub fn select_new(mut posts: Vec<Post>, state: &mut AccountPollState) -> DedupOutcome {
    posts.sort_by(|a, b| b.id.cmp(&a.id));
    posts.dedup_by(|a, b| a.id == b.id);

    let account = state.account_id.clone();
    let first_observation = state.is_fresh();

    let (pinned, candidates): (Vec<Post>, Vec<Post>) =
        posts.into_iter().partition(|post| post.is_pinned);
    for post in &pinned {
        state.seen_ids.insert(post.id.clone());
    }

    let outcome = if first_observation {
        for post in &candidates {
            state.seen_ids.insert(post.id.clone());
        }

        match candidates.into_iter().next() {
            Some(top) => {
                let changed = state.advance_last_seen(&top.id);
                info!(
                    "@{account}: first observation, marked history as seen and kept latest post {id}",
                    id = top.id
                );
                DedupOutcome {
                    new_posts: vec![top],
                    high_water_changed: changed,
                }
            }
            None => DedupOutcome::default(),
        }
    } else if let Some(mark) = state.last_seen_id.clone() {
        let new_posts: Vec<Post> = candidates
            .into_iter()
            .filter(|post| post.id > mark)
            .collect();

        let mut changed = false;
        if let Some(top) = new_posts.first() {
            changed = state.advance_last_seen(&top.id);
            for post in &new_posts {
                state.seen_ids.insert(post.id.clone());
            }
        }
        DedupOutcome {
            new_posts,
            high_water_changed: changed,
        }
    } else {
        // Seen ids without a high-water mark: fall back to set membership
        let new_posts: Vec<Post> = candidates
            .into_iter()
            .filter(|post| !state.seen_ids.contains(&post.id))
            .collect();

        let mut changed = false;
        for post in &new_posts {
            state.seen_ids.insert(post.id.clone());
        }
        if let Some(top) = new_posts.first() {
            changed = state.advance_last_seen(&top.id);
        }
        DedupOutcome {
            new_posts,
            high_water_changed: changed,
        }
    };

    state.prune_seen();

    debug!(
        "@{account}: {new_count} new posts, high-water mark {mark:?}",
        new_count = outcome.new_posts.len(),
        mark = state.last_seen_id.as_ref().map(|id| id.as_str())
    );

    outcome
}

/// Mark everything in `posts` as seen without selecting anything.
///
/// Used for accounts that start with no stored state when existing posts
/// should be suppressed. Returns whether the high-water mark changed.
pub fn prime(posts: &[Post], state: &mut AccountPollState) -> bool {
    for post in posts {
        state.seen_ids.insert(post.id.clone());
    }

    let changed = match posts.iter().filter(|p| !p.is_pinned).map(|p| &p.id).max() {
        Some(top) => state.advance_last_seen(top),
        None => false,
    };
    state.prune_seen();

    info!(
        "@{account}: recorded {count} existing posts as seen",
        account = state.account_id,
        count = posts.len()
    );
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::post::PostId;
    use pretty_assertions::assert_eq;

    fn id(raw: &str) -> PostId {
        raw.parse().unwrap()
    }

    fn post(raw: &str) -> Post {
        Post {
            id: id(raw),
            text: format!("post {raw}"),
            created_at: String::new(),
            author: "alice".to_string(),
            canonical_url: format!("https://twitter.com/alice/status/{raw}"),
            media: Vec::new(),
            is_pinned: false,
        }
    }

    fn pinned(raw: &str) -> Post {
        Post {
            is_pinned: true,
            ..post(raw)
        }
    }

    fn ids(posts: &[Post]) -> Vec<&str> {
        posts.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_first_run_returns_only_latest() {
        let mut state = AccountPollState::new("alice");
        let outcome = select_new(vec![post("103"), post("105"), post("104")], &mut state);

        assert_eq!(ids(&outcome.new_posts), vec!["105"]);
        assert!(outcome.high_water_changed);
        assert_eq!(state.last_seen_id, Some(id("105")));
        for raw in ["103", "104", "105"] {
            assert!(state.seen_ids.contains(&id(raw)));
        }
    }

    #[test]
    fn test_incremental_detection_in_descending_order() {
        let mut state = AccountPollState::restored("alice", Some(id("103")));
        let outcome = select_new(
            vec![post("104"), post("106"), post("103"), post("105")],
            &mut state,
        );

        assert_eq!(ids(&outcome.new_posts), vec!["106", "105", "104"]);
        assert_eq!(state.last_seen_id, Some(id("106")));
    }

    #[test]
    fn test_second_pass_is_idempotent() {
        let mut state = AccountPollState::restored("alice", Some(id("103")));
        let fetched = vec![post("106"), post("105"), post("104"), post("103")];

        let first = select_new(fetched.clone(), &mut state);
        assert_eq!(first.new_posts.len(), 3);

        let second = select_new(fetched, &mut state);
        assert!(second.new_posts.is_empty());
        assert!(!second.high_water_changed);
        assert_eq!(state.last_seen_id, Some(id("106")));
    }

    #[test]
    fn test_first_run_idempotent_too() {
        let mut state = AccountPollState::new("alice");
        let fetched = vec![post("105"), post("104")];

        assert_eq!(select_new(fetched.clone(), &mut state).new_posts.len(), 1);
        assert!(select_new(fetched, &mut state).new_posts.is_empty());
    }

    #[test]
    fn test_numeric_not_lexicographic_comparison() {
        let mut state = AccountPollState::restored("alice", Some(id("9")));
        let outcome = select_new(vec![post("10"), post("8"), post("9")], &mut state);

        assert_eq!(ids(&outcome.new_posts), vec!["10"]);
        assert_eq!(state.last_seen_id, Some(id("10")));
    }

    #[test]
    fn test_pinned_posts_are_never_delivered() {
        let mut state = AccountPollState::new("alice");
        let outcome = select_new(vec![pinned("50"), post("199"), post("200")], &mut state);

        assert_eq!(ids(&outcome.new_posts), vec!["200"]);
        assert_eq!(state.last_seen_id, Some(id("200")));
        assert!(state.seen_ids.contains(&id("50")));
        assert!(state.seen_ids.contains(&id("199")));
    }

    #[test]
    fn test_pinned_post_above_mark_does_not_move_it() {
        let mut state = AccountPollState::restored("alice", Some(id("100")));
        let outcome = select_new(vec![pinned("500"), post("100")], &mut state);

        assert!(outcome.new_posts.is_empty());
        assert!(!outcome.high_water_changed);
        assert_eq!(state.last_seen_id, Some(id("100")));
        assert!(state.seen_ids.contains(&id("500")));
    }

    #[test]
    fn test_first_run_with_only_pinned_posts() {
        let mut state = AccountPollState::new("alice");
        let outcome = select_new(vec![pinned("77")], &mut state);

        assert!(outcome.new_posts.is_empty());
        assert_eq!(state.last_seen_id, None);
        assert!(state.seen_ids.contains(&id("77")));

        // The account is no longer fresh, so later posts go through set membership
        let later = select_new(vec![pinned("77"), post("80"), post("79")], &mut state);
        assert_eq!(ids(&later.new_posts), vec!["80", "79"]);
        assert_eq!(state.last_seen_id, Some(id("80")));
    }

    #[test]
    fn test_recovery_without_mark_uses_seen_set() {
        let mut state = AccountPollState::new("alice");
        state.seen_ids.insert(id("10"));
        state.seen_ids.insert(id("11"));

        let outcome = select_new(vec![post("12"), post("11"), post("10"), post("13")], &mut state);

        assert_eq!(ids(&outcome.new_posts), vec!["13", "12"]);
        assert!(outcome.high_water_changed);
        assert_eq!(state.last_seen_id, Some(id("13")));
    }

    #[test]
    fn test_empty_fetch_changes_nothing() {
        let mut state = AccountPollState::restored("alice", Some(id("5")));
        let outcome = select_new(Vec::new(), &mut state);
        assert!(outcome.new_posts.is_empty());
        assert!(!outcome.high_water_changed);

        let mut fresh = AccountPollState::new("bob");
        assert!(select_new(Vec::new(), &mut fresh).new_posts.is_empty());
        assert!(fresh.is_fresh());
    }

    #[test]
    fn test_duplicate_ids_in_one_fetch_are_collapsed() {
        let mut state = AccountPollState::restored("alice", Some(id("1")));
        let outcome = select_new(vec![post("2"), post("2"), post("3")], &mut state);
        assert_eq!(ids(&outcome.new_posts), vec!["3", "2"]);
    }

    #[test]
    fn test_prime_marks_everything_without_selecting() {
        let mut state = AccountPollState::new("alice");
        let changed = prime(&[post("30"), pinned("99"), post("31")], &mut state);

        assert!(changed);
        assert_eq!(state.last_seen_id, Some(id("31")));
        assert_eq!(state.seen_ids.len(), 3);

        let outcome = select_new(vec![pinned("99"), post("31"), post("32")], &mut state);
        assert_eq!(ids(&outcome.new_posts), vec!["32"]);
    }
}
