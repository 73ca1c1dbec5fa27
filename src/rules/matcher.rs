//! Deterministic rule matcher.
//!
//! Evaluates every enabled rule's conditions (AND-ed) against a
//! normalized email and returns ranked candidates. Ordering is fully
//! deterministic given a fixed rule set and email — no AI is consulted
//! here. `AiMatch` conditions pass trivially but tag the candidate so the
//! selector knows confirmation is still required.

use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::config::TieBreak;
use crate::email::EmailContext;
use crate::rules::model::{Condition, Rule};

/// A rule whose deterministic conditions all hold for an email.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub rule: Rule,
    /// The rule carries an `AiMatch` condition and must be confirmed by
    /// the selector even if it is the only candidate.
    pub needs_ai: bool,
}

/// Deterministic condition evaluator and candidate ranker.
pub struct Matcher {
    tie_break: TieBreak,
}

impl Matcher {
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    /// Evaluate all rules and return candidates ranked by priority
    /// (descending), ties broken per the configured policy, then by
    /// creation time (earlier wins), then by id for total determinism.
    ///
    /// A malformed rule (e.g. an invalid regex condition) is skipped with
    /// a warning; the remaining rules are still considered.
    pub fn candidates(&self, ctx: &EmailContext, rules: &[Rule]) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            match self.rule_matches(ctx, rule) {
                Ok(true) => candidates.push(Candidate {
                    rule: rule.clone(),
                    needs_ai: rule.needs_ai_confirmation(),
                }),
                Ok(false) => {}
                Err(reason) => {
                    warn!(
                        rule_id = %rule.id,
                        rule = %rule.name,
                        reason = %reason,
                        "Skipping malformed rule"
                    );
                }
            }
        }

        candidates.sort_by(|a, b| self.rank(a, b));

        debug!(
            email_id = %ctx.email.id,
            candidates = candidates.len(),
            "Matcher produced candidates"
        );
        candidates
    }

    /// All conditions must hold.
    fn rule_matches(&self, ctx: &EmailContext, rule: &Rule) -> Result<bool, String> {
        for condition in &rule.conditions {
            let holds = match condition {
                Condition::From { pattern } => pattern.matches(&ctx.email.from)?,
                Condition::Subject { pattern } => pattern.matches(&ctx.email.subject)?,
                Condition::Body { pattern } => pattern.matches(&ctx.email.body)?,
                Condition::Category { name } => ctx.in_category(name),
                // Trivially true; tagged for the selector.
                Condition::AiMatch { .. } => true,
            };
            if !holds {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn rank(&self, a: &Candidate, b: &Candidate) -> Ordering {
        // Higher priority first
        b.rule
            .priority
            .cmp(&a.rule.priority)
            .then_with(|| match self.tie_break {
                TieBreak::CreationOrder => Ordering::Equal,
                // More conditions first
                TieBreak::MostSpecific => {
                    b.rule.conditions.len().cmp(&a.rule.conditions.len())
                }
            })
            // Earlier-created wins
            .then_with(|| a.rule.created_at.cmp(&b.rule.created_at))
            .then_with(|| a.rule.id.cmp(&b.rule.id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::email::EmailMessage;
    use crate::rules::model::{Action, Pattern};

    fn email(from: &str, subject: &str, body: &str) -> EmailMessage {
        EmailMessage {
            id: "m-1".into(),
            thread_id: "t-1".into(),
            from: from.into(),
            from_name: None,
            to: vec!["me@corp.com".into()],
            reply_to: None,
            subject: subject.into(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }

    fn ctx(from: &str, subject: &str, body: &str, categories: &[&str]) -> EmailContext {
        EmailContext::new(
            email(from, subject, body),
            categories.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn all_conditions_are_anded() {
        let rule = Rule::new("u-1", "newsletter archive")
            .with_condition(Condition::From {
                pattern: Pattern::exact("newsletter@x.com"),
            })
            .with_condition(Condition::Category {
                name: "Newsletter".into(),
            })
            .with_action(Action::Archive);

        let matcher = Matcher::new(TieBreak::CreationOrder);

        // Both conditions hold
        let c = ctx("newsletter@x.com", "Weekly", "...", &["Newsletter"]);
        assert_eq!(matcher.candidates(&c, &[rule.clone()]).len(), 1);

        // Category missing — no match
        let c = ctx("newsletter@x.com", "Weekly", "...", &[]);
        assert!(matcher.candidates(&c, &[rule.clone()]).is_empty());

        // Sender differs — no match
        let c = ctx("other@x.com", "Weekly", "...", &["Newsletter"]);
        assert!(matcher.candidates(&c, &[rule]).is_empty());
    }

    #[test]
    fn disabled_rules_never_match() {
        let mut rule = Rule::new("u-1", "disabled").with_condition(Condition::Subject {
            pattern: Pattern::contains("hello"),
        });
        rule.enabled = false;

        let matcher = Matcher::new(TieBreak::CreationOrder);
        let c = ctx("a@b.com", "hello there", "", &[]);
        assert!(matcher.candidates(&c, &[rule]).is_empty());
    }

    #[test]
    fn ai_match_passes_trivially_and_tags_candidate() {
        let rule = Rule::new("u-1", "looks like an invoice").with_condition(Condition::AiMatch {
            instruction: "the email is an invoice".into(),
        });

        let matcher = Matcher::new(TieBreak::CreationOrder);
        let c = ctx("anyone@anywhere.com", "anything", "any body", &[]);
        let candidates = matcher.candidates(&c, &[rule]);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].needs_ai);
    }

    #[test]
    fn candidates_ranked_by_priority_then_creation() {
        let mut low = Rule::new("u-1", "low")
            .with_condition(Condition::Subject {
                pattern: Pattern::contains("report"),
            })
            .with_priority(1);
        let mut high = Rule::new("u-1", "high")
            .with_condition(Condition::Subject {
                pattern: Pattern::contains("report"),
            })
            .with_priority(10);
        let mut older_peer = Rule::new("u-1", "older peer")
            .with_condition(Condition::Subject {
                pattern: Pattern::contains("report"),
            })
            .with_priority(10);

        let now = Utc::now();
        low.created_at = now;
        high.created_at = now;
        older_peer.created_at = now - Duration::hours(1);

        let matcher = Matcher::new(TieBreak::CreationOrder);
        let c = ctx("a@b.com", "quarterly report", "", &[]);
        let candidates = matcher.candidates(&c, &[low.clone(), high.clone(), older_peer.clone()]);

        let names: Vec<&str> = candidates.iter().map(|c| c.rule.name.as_str()).collect();
        assert_eq!(names, vec!["older peer", "high", "low"]);
    }

    #[test]
    fn most_specific_tie_break_prefers_more_conditions() {
        let now = Utc::now();
        let mut broad = Rule::new("u-1", "broad").with_condition(Condition::Subject {
            pattern: Pattern::contains("report"),
        });
        let mut narrow = Rule::new("u-1", "narrow")
            .with_condition(Condition::Subject {
                pattern: Pattern::contains("report"),
            })
            .with_condition(Condition::From {
                pattern: Pattern::contains("@corp.com"),
            });
        // Broad was created first, so CreationOrder would pick it
        broad.created_at = now - Duration::hours(1);
        narrow.created_at = now;

        let c = ctx("boss@corp.com", "weekly report", "", &[]);

        let creation = Matcher::new(TieBreak::CreationOrder);
        assert_eq!(
            creation.candidates(&c, &[broad.clone(), narrow.clone()])[0].rule.name,
            "broad"
        );

        let specific = Matcher::new(TieBreak::MostSpecific);
        assert_eq!(
            specific.candidates(&c, &[broad, narrow])[0].rule.name,
            "narrow"
        );
    }

    #[test]
    fn malformed_rule_is_skipped_and_others_continue() {
        let bad = Rule::new("u-1", "bad regex").with_condition(Condition::From {
            pattern: Pattern::regex("([unclosed"),
        });
        let good = Rule::new("u-1", "good").with_condition(Condition::From {
            pattern: Pattern::contains("@x.com"),
        });

        let matcher = Matcher::new(TieBreak::CreationOrder);
        let c = ctx("sender@x.com", "s", "b", &[]);
        let candidates = matcher.candidates(&c, &[bad, good]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].rule.name, "good");
    }

    #[test]
    fn ranking_is_reproducible() {
        let rules: Vec<Rule> = (0..5)
            .map(|i| {
                Rule::new("u-1", format!("r{i}"))
                    .with_condition(Condition::Body {
                        pattern: Pattern::contains("ping"),
                    })
                    .with_priority(3)
            })
            .collect();

        let matcher = Matcher::new(TieBreak::CreationOrder);
        let c = ctx("a@b.com", "s", "ping", &[]);
        let first: Vec<_> = matcher
            .candidates(&c, &rules)
            .iter()
            .map(|c| c.rule.id)
            .collect();
        let second: Vec<_> = matcher
            .candidates(&c, &rules)
            .iter()
            .map(|c| c.rule.id)
            .collect();
        assert_eq!(first, second);
    }
}
