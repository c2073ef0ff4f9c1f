use chrono::{DateTime, Duration, Utc};
use warden_contracts::{DEMO_SESSION_TTL_HOURS, DEMO_USERNAME};

/// One entry of the action registry: a transport route bound to its canonical
/// permission-scoped action, plus whether the action is faked for the demo
/// identity. The table is the single source of truth for both resolution and
/// the simulation allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRule {
    pub method: &'static str,
    pub template: &'static str,
    pub action: &'static str,
    pub simulate: bool,
}

const fn rule(
    method: &'static str,
    template: &'static str,
    action: &'static str,
    simulate: bool,
) -> RouteRule {
    RouteRule {
        method,
        template,
        action,
        simulate,
    }
}

/// The full route table of the control panel API. `:name` segments match
/// exactly one non-empty path segment. Read routes carry `simulate: false`
/// and are never intercepted; mutating routes carry `simulate: true`.
pub static RULES: &[RouteRule] = &[
    // server process
    rule("GET", "/api/server/status", "server.view", false),
    rule("POST", "/api/server/start", "server.start", true),
    rule("POST", "/api/server/stop", "server.stop", true),
    rule("POST", "/api/server/restart", "server.restart", true),
    rule("POST", "/api/server/command", "server.command", true),
    // players
    rule("GET", "/api/players", "players.view", false),
    rule("POST", "/api/players/:name/kick", "players.kick", true),
    rule("POST", "/api/players/:name/ban", "players.ban", true),
    rule("DELETE", "/api/players/:name/ban", "players.unban", true),
    rule("POST", "/api/players/:name/op", "players.op", true),
    rule("DELETE", "/api/players/:name/op", "players.deop", true),
    rule("GET", "/api/whitelist", "whitelist.view", false),
    rule("POST", "/api/players/:name/whitelist", "whitelist.add", true),
    rule(
        "DELETE",
        "/api/players/:name/whitelist",
        "whitelist.remove",
        true,
    ),
    // users and roles
    rule("GET", "/api/users", "users.view", false),
    rule("POST", "/api/users", "users.create", true),
    rule("PUT", "/api/users/:id", "users.update", true),
    rule("DELETE", "/api/users/:id", "users.delete", true),
    rule("GET", "/api/roles", "roles.view", false),
    rule("POST", "/api/roles", "roles.create", true),
    rule("PUT", "/api/roles/:id", "roles.update", true),
    rule("DELETE", "/api/roles/:id", "roles.delete", true),
    // backups
    rule("GET", "/api/backups", "backups.view", false),
    rule("POST", "/api/backups", "backups.create", true),
    rule("POST", "/api/backups/:id/restore", "backups.restore", true),
    rule("DELETE", "/api/backups/:id", "backups.delete", true),
    // scheduler
    rule("GET", "/api/scheduler/tasks", "scheduler.view", false),
    rule("POST", "/api/scheduler/tasks", "scheduler.create", true),
    rule("PUT", "/api/scheduler/tasks/:id", "scheduler.update", true),
    rule(
        "DELETE",
        "/api/scheduler/tasks/:id",
        "scheduler.delete",
        true,
    ),
    rule("POST", "/api/scheduler/tasks/:id/run", "scheduler.run", true),
    // mods and plugins
    rule("GET", "/api/mods", "mods.view", false),
    rule("POST", "/api/mods", "mods.install", true),
    rule("PUT", "/api/mods/:id", "mods.update", true),
    rule("DELETE", "/api/mods/:id", "mods.remove", true),
    rule("GET", "/api/plugins", "plugins.view", false),
    rule("POST", "/api/plugins", "plugins.install", true),
    rule("PUT", "/api/plugins/:id", "plugins.update", true),
    rule("DELETE", "/api/plugins/:id", "plugins.remove", true),
    // configuration and files
    rule("GET", "/api/config", "config.view", false),
    rule("PUT", "/api/config", "config.save", true),
    rule("GET", "/api/files", "files.view", false),
    rule("PUT", "/api/files", "files.write", true),
    rule("DELETE", "/api/files", "files.delete", true),
    rule("POST", "/api/files/upload", "files.upload", true),
];

/// Resolve a request path and method to a route rule, or `None` for
/// "unmapped, do not intercept".
///
/// Precedence is deterministic: exact literal templates win over
/// parameterized ones regardless of declaration order; among matching
/// parameterized templates the one with the fewest `:name` segments wins;
/// ties fall to the first declared rule.
pub fn resolve(path: &str, method: &str) -> Option<&'static RouteRule> {
    resolve_in(RULES, path, method)
}

pub fn resolve_in<'a>(rules: &'a [RouteRule], path: &str, method: &str) -> Option<&'a RouteRule> {
    let path = normalize_path(path);

    if let Some(found) = rules
        .iter()
        .find(|r| r.method == method && !is_parameterized(r.template) && r.template == path)
    {
        return Some(found);
    }

    let mut best: Option<(usize, &RouteRule)> = None;
    for candidate in rules
        .iter()
        .filter(|r| r.method == method && is_parameterized(r.template))
    {
        if !template_matches(candidate.template, path) {
            continue;
        }
        let wildcards = wildcard_count(candidate.template);
        match best {
            Some((current, _)) if current <= wildcards => {}
            _ => best = Some((wildcards, candidate)),
        }
    }
    best.map(|(_, r)| r)
}

/// Look up a rule by its canonical action identifier.
pub fn find_action(action: &str) -> Option<&'static RouteRule> {
    RULES.iter().find(|r| r.action == action)
}

/// Every action identifier flagged for simulation, in table order.
pub fn simulated_actions() -> Vec<&'static str> {
    RULES
        .iter()
        .filter(|r| r.simulate)
        .map(|r| r.action)
        .collect()
}

/// The fixed permission set issued to the demo identity: every distinct
/// action identifier in the table, in table order.
pub fn demo_permissions() -> Vec<&'static str> {
    let mut out: Vec<&'static str> = Vec::with_capacity(RULES.len());
    for r in RULES {
        if !out.contains(&r.action) {
            out.push(r.action);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoPolicy {
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptDecision {
    PassThrough,
    Simulate { action: &'static str },
}

pub fn is_demo_user(username: &str) -> bool {
    username == DEMO_USERNAME
}

/// Decide whether a request must be intercepted. Rule order: disabled demo
/// mode never simulates; a caller other than the demo sentinel never
/// simulates; an unresolved route passes through (intentionally permissive
/// for read-only and unlisted endpoints); otherwise simulate iff the rule is
/// flagged. Every input resolves to a definite decision; there is no error
/// path.
pub fn evaluate_demo_policy(
    policy: &DemoPolicy,
    caller: Option<&str>,
    rule: Option<&'static RouteRule>,
) -> InterceptDecision {
    if !policy.enabled {
        return InterceptDecision::PassThrough;
    }
    let Some(caller) = caller else {
        return InterceptDecision::PassThrough;
    };
    if !is_demo_user(caller) {
        return InterceptDecision::PassThrough;
    }
    match rule {
        Some(rule) if rule.simulate => InterceptDecision::Simulate {
            action: rule.action,
        },
        _ => InterceptDecision::PassThrough,
    }
}

pub fn session_expiry(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + Duration::hours(DEMO_SESSION_TTL_HOURS)
}

pub fn next_reset_after(last_reset: DateTime<Utc>, interval_hours: i64) -> DateTime<Utc> {
    last_reset + Duration::hours(interval_hours)
}

fn normalize_path(path: &str) -> &str {
    let path = path.split('?').next().unwrap_or(path);
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

fn is_parameterized(template: &str) -> bool {
    template.split('/').any(|seg| seg.starts_with(':'))
}

fn wildcard_count(template: &str) -> usize {
    template.split('/').filter(|seg| seg.starts_with(':')).count()
}

fn template_matches(template: &str, path: &str) -> bool {
    let mut t = template.split('/');
    let mut p = path.split('/');
    loop {
        match (t.next(), p.next()) {
            (None, None) => return true,
            (Some(ts), Some(ps)) => {
                if ts.starts_with(':') {
                    if ps.is_empty() {
                        return false;
                    }
                } else if ts != ps {
                    return false;
                }
            }
            _ => return false,
        }
    }
}
