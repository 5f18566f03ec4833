//! Exit-status transition resolver.
//!
//! Pure functions: the same rules and exit status always give the same
//! resolution.

use batchline_types::definition::{Transition, TransitionAction};

/// Glob match over characters: `*` matches any run (including empty), `?`
/// exactly one character, everything else itself.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    // Last `*` seen and the text position it is currently absorbing up to.
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) && pattern[p] != '*' {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// What to do after an element finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAction {
    /// Continue with the named sibling element.
    Next(String),
    Stop {
        exit_status: Option<String>,
        restart: Option<String>,
    },
    Fail {
        exit_status: Option<String>,
    },
    End {
        exit_status: Option<String>,
    },
    /// Nothing follows: the scope ends normally.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub action: ResolvedAction,
    /// Index of the rule that fired, `None` when the implicit `next` (or
    /// end of scope) applied.
    pub rule: Option<usize>,
}

impl Resolution {
    pub fn matched(&self) -> bool {
        self.rule.is_some()
    }
}

/// First rule (in declaration order) whose `on` pattern matches wins.
/// Without a match, take `default_next` or complete the scope.
pub fn resolve(exit_status: &str, rules: &[Transition], default_next: Option<&str>) -> Resolution {
    for (index, rule) in rules.iter().enumerate() {
        if glob_match(&rule.on, exit_status) {
            let action = match &rule.action {
                TransitionAction::Next { to } => ResolvedAction::Next(to.clone()),
                TransitionAction::Stop {
                    exit_status,
                    restart,
                } => ResolvedAction::Stop {
                    exit_status: exit_status.clone(),
                    restart: restart.clone(),
                },
                TransitionAction::Fail { exit_status } => ResolvedAction::Fail {
                    exit_status: exit_status.clone(),
                },
                TransitionAction::End { exit_status } => ResolvedAction::End {
                    exit_status: exit_status.clone(),
                },
            };
            return Resolution {
                action,
                rule: Some(index),
            };
        }
    }

    let action = match default_next {
        Some(next) => ResolvedAction::Next(next.to_string()),
        None => ResolvedAction::Complete,
    };
    Resolution { action, rule: None }
}
