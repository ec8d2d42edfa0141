//! Parser for bot commands in comment text.
//!
//! This module provides a pure parser that turns free-form comment text into
//! an ordered list of commands.

use crate::comments::extract_fragments;
use crate::types::{Sha, is_sha};

use super::types::{Command, PingKind, rollup_mode_for};

/// Inputs that identify who wrote a comment and what it applies to.
#[derive(Debug, Clone, Copy)]
pub struct CommentSource<'a> {
    /// Login of the comment author, without `@`.
    pub actor: &'a str,
    /// Commit the comment was made on (review comments), if any.
    pub pinned_sha: Option<&'a Sha>,
}

/// Parses every command addressed to `bot_name` in a comment.
///
/// # Parsing Rules
///
/// - Only lines mentioning `@{bot_name}` are considered, and each is read from
///   its last mention onwards, so prose before the mention is never parsed.
/// - The mention is case-insensitive and must stand on its own (`@bots`
///   does not mention `@bot`); a trailing `:` or `,` is allowed.
/// - The words of all mentioning lines form one stream. Parsing stops at the
///   first word that is not a command.
/// - `r=me` is ignored, as are malformed numbers in `p=` and `treeclosed=`.
/// - Comments written by the bot itself are only read for hidden
///   `<!-- @bot ... -->` lines and state fragments, which come first.
///
/// # Examples
///
/// ```
/// use merge_queue::commands::{Command, CommentSource, parse_commands};
///
/// let source = CommentSource { actor: "alice", pinned_sha: None };
/// let commands = parse_commands(source, "LGTM @bors r+ p=5", "bors", &[]);
/// assert_eq!(
///     commands,
///     vec![
///         Command::Approve { approver: "alice".into(), sha: None },
///         Command::Prioritize { priority: 5 },
///     ]
/// );
/// ```
pub fn parse_commands(
    source: CommentSource<'_>,
    body: &str,
    bot_name: &str,
    hook_names: &[String],
) -> Vec<Command> {
    let from_bot = source.actor.eq_ignore_ascii_case(bot_name);
    let mut commands = Vec::new();

    if from_bot {
        for fragment in extract_fragments(body) {
            match fragment {
                Ok(comment) => commands.push(Command::Resync { comment }),
                Err(e) => tracing::warn!(error = %e, "Ignoring malformed state fragment"),
            }
        }
    }

    let trigger = format!("@{}", bot_name);
    let words: Vec<&str> = body
        .lines()
        .filter(|line| !from_bot || line.trim_start().starts_with("<!--"))
        .filter_map(|line| words_after_last_trigger(line, &trigger))
        .flat_map(|rest| rest.split_whitespace())
        .collect();

    if words == ["are", "you", "still", "there?"] {
        commands.push(Command::Ping {
            kind: PingKind::Portal,
        });
    }

    let mut iter = words.iter().copied().peekable();
    while let Some(word) = iter.next() {
        if is_trigger_word(word, &trigger) {
            continue;
        }

        if word == "r+" || word.starts_with("r=") {
            let sha = match iter.peek() {
                Some(next) if is_sha(next) => {
                    let sha = next.to_string();
                    iter.next();
                    Some(sha)
                }
                _ => source.pinned_sha.map(|sha| sha.as_str().to_string()),
            };
            let approver = match word.strip_prefix("r=") {
                Some(name) => name.trim_start_matches('@'),
                None => source.actor,
            };
            // Self-approval guard.
            if approver == "me" || approver.is_empty() {
                continue;
            }
            commands.push(Command::Approve {
                approver: approver.to_string(),
                sha,
            });
        } else if word == "r-" {
            commands.push(Command::Unapprove);
        } else if let Some(value) = word.strip_prefix("p=") {
            if let Ok(priority) = value.parse() {
                commands.push(Command::Prioritize { priority });
            }
        } else if let Some(name) = word.strip_prefix("delegate=") {
            let name = name.trim_start_matches('@');
            if !name.is_empty() {
                commands.push(Command::Delegate {
                    to: name.to_string(),
                });
            }
        } else if word == "delegate-" {
            commands.push(Command::Undelegate);
        } else if word == "delegate+" {
            commands.push(Command::DelegateAuthor);
        } else if word == "retry" {
            commands.push(Command::Retry);
        } else if word == "try" {
            commands.push(Command::Try);
        } else if word == "try-" {
            commands.push(Command::Untry);
        } else if let Some(mode) = rollup_mode_for(word) {
            commands.push(Command::Rollup { mode });
        } else if word == "force" {
            commands.push(Command::Force);
        } else if word == "clean" {
            commands.push(Command::Clean);
        } else if word == "ping" || word == "hello?" {
            commands.push(Command::Ping {
                kind: PingKind::Standard,
            });
        } else if let Some(value) = word.strip_prefix("treeclosed=") {
            if let Ok(threshold) = value.parse() {
                commands.push(Command::TreeClosed { threshold });
            }
        } else if word == "treeclosed-" {
            commands.push(Command::TreeOpen);
        } else if let Some(hook) = parse_hook(word, hook_names) {
            commands.push(hook);
        } else {
            break;
        }
    }

    commands
}

/// Returns the part of `line` following its last standalone mention of
/// `trigger`, or `None` if the line does not mention it.
fn words_after_last_trigger<'a>(line: &'a str, trigger: &str) -> Option<&'a str> {
    let mut found = None;
    let mut search_pos = 0;
    while let Some(pos) = find_trigger(line, search_pos, trigger) {
        found = Some(pos + trigger.len());
        search_pos = pos + trigger.len();
    }
    found.map(|end| &line[end..])
}

/// Finds the next occurrence of the trigger (case-insensitive) at a valid
/// word boundary. Returns the byte position of the `@` character.
fn find_trigger(text: &str, start: usize, trigger: &str) -> Option<usize> {
    let mut search_pos = start;

    while search_pos < text.len() {
        let at_pos = text[search_pos..].find('@')?;
        let abs_pos = search_pos + at_pos;
        let end = abs_pos + trigger.len();

        if let Some(candidate) = text.get(abs_pos..end) {
            if candidate.eq_ignore_ascii_case(trigger) {
                let left_ok = text[..abs_pos]
                    .chars()
                    .next_back()
                    .is_none_or(|c| !c.is_alphanumeric());
                let right_ok = text[end..]
                    .chars()
                    .next()
                    .is_none_or(|c| !(c.is_alphanumeric() || c == '-' || c == '_'));
                if left_ok && right_ok {
                    return Some(abs_pos);
                }
            }
        }

        search_pos = abs_pos + 1;
    }
    None
}

/// The remains of the mention itself after splitting, e.g. `:` in `@bot: r+`.
fn is_trigger_word(word: &str, trigger: &str) -> bool {
    if matches!(word, ":" | ",") {
        return true;
    }
    word.get(..trigger.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(trigger))
        && matches!(&word[trigger.len()..], "" | ":" | ",")
}

fn parse_hook(word: &str, hook_names: &[String]) -> Option<Command> {
    hook_names.iter().find_map(|hook| {
        if word == hook {
            return Some(Command::Hook {
                name: hook.clone(),
                extra: None,
            });
        }
        let extra = word.strip_prefix(hook.as_str())?.strip_prefix('=')?;
        Some(Command::Hook {
            name: hook.clone(),
            extra: Some(extra.to_string()),
        })
    })
}
