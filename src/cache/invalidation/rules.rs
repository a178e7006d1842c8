//! Static event → pattern table.
//!
//! Each domain event names the key patterns it invalidates plus symbolic
//! propagations that expand into further patterns. Patterns may carry
//! `{field}` placeholders filled from the event payload; a missing field
//! widens the placeholder to one key segment.

use std::fmt;

use regex::escape;
use serde::Serialize;
use serde_json::Value;

use crate::cache::keys::KeyPattern;

pub const USER_LOGIN: &str = "USER_LOGIN";
pub const USER_LOGOUT: &str = "USER_LOGOUT";
pub const USER_PROFILE_UPDATED: &str = "USER_PROFILE_UPDATED";
pub const CLAN_UPDATED: &str = "CLAN_UPDATED";
pub const CLAN_MEMBERSHIP_CHANGED: &str = "CLAN_MEMBERSHIP_CHANGED";
pub const TOKEN_TRANSFER: &str = "TOKEN_TRANSFER";
pub const PROPOSAL_CREATED: &str = "PROPOSAL_CREATED";
pub const VOTE_CAST: &str = "VOTE_CAST";
pub const GAME_COMPLETED: &str = "GAME_COMPLETED";
pub const APP_VERSION_CHANGED: &str = "APP_VERSION_CHANGED";
pub const CACHE_RESET: &str = "CACHE_RESET";

/// Symbolic macro expanding into a fixed pattern list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Propagation {
    AllUserData,
    UserUi,
    ClanUi,
    AllAssets,
    ServiceWorker,
    CompleteCache,
}

impl Propagation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllUserData => "all-user-data",
            Self::UserUi => "user-ui",
            Self::ClanUi => "clan-ui",
            Self::AllAssets => "all-assets",
            Self::ServiceWorker => "service-worker",
            Self::CompleteCache => "complete-cache",
        }
    }

    pub fn patterns(self) -> &'static [&'static str] {
        match self {
            Self::AllUserData => &["^user:", "^session:", "^profile:", "^preferences:"],
            Self::UserUi => &["^ui:user", "^/api/(user|profile)"],
            Self::ClanUi => &["^ui:clan", "^/api/clans"],
            Self::AllAssets => &["^static:", "^/static/", "^assets?:", "^build:"],
            Self::ServiceWorker => &["^sw:", r"(^|/)(sw|service-worker)\.js$"],
            Self::CompleteCache => &[".*"],
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct EventRule {
    pub event: &'static str,
    pub patterns: &'static [&'static str],
    pub propagations: &'static [Propagation],
}

pub static EVENT_RULES: &[EventRule] = &[
    EventRule {
        event: USER_LOGIN,
        patterns: &["^session:"],
        propagations: &[Propagation::UserUi],
    },
    EventRule {
        event: USER_LOGOUT,
        patterns: &["^user:", "^session:"],
        propagations: &[Propagation::AllUserData],
    },
    EventRule {
        event: USER_PROFILE_UPDATED,
        patterns: &["^user:{userId}:", "^profile:{userId}"],
        propagations: &[Propagation::UserUi],
    },
    EventRule {
        event: CLAN_UPDATED,
        patterns: &["^clan:{clanId}:"],
        propagations: &[Propagation::ClanUi],
    },
    EventRule {
        event: CLAN_MEMBERSHIP_CHANGED,
        patterns: &["^clan:{clanId}:members", "^user:{userId}:clans"],
        propagations: &[Propagation::ClanUi],
    },
    EventRule {
        event: TOKEN_TRANSFER,
        patterns: &["^wallet:{address}", "^balance:"],
        propagations: &[Propagation::UserUi],
    },
    EventRule {
        event: PROPOSAL_CREATED,
        patterns: &["^dao:proposals", "^/api/proposals"],
        propagations: &[],
    },
    EventRule {
        event: VOTE_CAST,
        patterns: &["^proposal:{proposalId}", "^dao:proposals"],
        propagations: &[],
    },
    EventRule {
        event: GAME_COMPLETED,
        patterns: &["^game:{gameId}", "^leaderboard:"],
        propagations: &[Propagation::UserUi],
    },
    EventRule {
        event: APP_VERSION_CHANGED,
        patterns: &["^static:", "^assets?:", "^build:"],
        propagations: &[Propagation::AllAssets, Propagation::ServiceWorker],
    },
    EventRule {
        event: CACHE_RESET,
        patterns: &[],
        propagations: &[Propagation::CompleteCache],
    },
];

pub fn rule_for(event: &str) -> Option<&'static EventRule> {
    EVENT_RULES.iter().find(|rule| rule.event == event)
}

impl EventRule {
    /// Every pattern this event selects, propagations expanded, placeholders
    /// filled from `payload`.
    pub fn expand(&self, payload: &Value) -> Vec<KeyPattern> {
        let own = self.patterns.iter().map(|pattern| fill(pattern, payload));
        let propagated = self
            .propagations
            .iter()
            .flat_map(|propagation| propagation.patterns().iter())
            .map(|pattern| pattern.to_string());
        let mut sources: Vec<String> = own.chain(propagated).collect();
        sources.dedup();
        sources.iter().map(|source| KeyPattern::regex(source)).collect()
    }
}

const ANY_SEGMENT: &str = "[^:]+";

fn fill(pattern: &str, payload: &Value) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        out.push_str(&rest[..open]);
        let field = &rest[open + 1..open + close];
        match payload.get(field) {
            Some(Value::String(text)) => out.push_str(&escape(text)),
            Some(Value::Number(number)) => out.push_str(&number.to_string()),
            _ => out.push_str(ANY_SEGMENT),
        }
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    out
}
