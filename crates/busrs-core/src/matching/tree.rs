use super::rule::{MatchRule, MatchSpec, SignalHandler};
use crate::{ArgOptions, Message};
use std::collections::HashMap;
use std::sync::Arc;

/// Keys of one rule or signal, in tree order: sender, interface, member, path.
type Levels<'a> = [Option<&'a str>; 4];

fn rule_levels<'a>(sender_key: Option<&'a str>, spec: &'a MatchSpec) -> Levels<'a> {
    [
        sender_key,
        spec.interface.as_deref(),
        spec.member.as_deref(),
        spec.path.as_deref(),
    ]
}

#[derive(Default)]
struct Node {
    wildcard: Option<Box<Node>>,
    exact: HashMap<String, Node>,
    rules: Vec<Arc<MatchRule>>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.wildcard.is_none() && self.exact.is_empty() && self.rules.is_empty()
    }

    fn child_mut(&mut self, key: Option<&str>) -> &mut Node {
        match key {
            None => self.wildcard.get_or_insert_with(Box::default),
            Some(key) => self.exact.entry(key.to_owned()).or_default(),
        }
    }

    /// The wildcard child and the child for `value`: at most two nodes.
    fn get_matches(&self, value: Option<&str>) -> impl Iterator<Item = &Node> {
        let exact = value.and_then(|v| self.exact.get(v));
        self.wildcard.as_deref().into_iter().chain(exact)
    }

    fn collect<'a>(&'a self, levels: &[Option<&str>], out: &mut Vec<&'a Node>) {
        match levels.split_first() {
            None => out.push(self),
            Some((value, rest)) => {
                for child in self.get_matches(*value) {
                    child.collect(rest, out);
                }
            }
        }
    }

    fn remove_at(
        &mut self,
        levels: &[Option<&str>],
        pred: &dyn Fn(&Arc<MatchRule>) -> bool,
        removed: &mut Vec<Arc<MatchRule>>,
    ) {
        let Some((key, rest)) = levels.split_first() else {
            self.rules.retain(|rule| {
                if pred(rule) {
                    removed.push(Arc::clone(rule));
                    false
                } else {
                    true
                }
            });
            return;
        };
        match key {
            None => {
                if let Some(child) = self.wildcard.as_mut() {
                    child.remove_at(rest, pred, removed);
                    if child.is_empty() {
                        self.wildcard = None;
                    }
                }
            }
            Some(key) => {
                if let Some(child) = self.exact.get_mut(*key) {
                    child.remove_at(rest, pred, removed);
                    if child.is_empty() {
                        self.exact.remove(*key);
                    }
                }
            }
        }
    }

    /// Remove every rule in this subtree accepted by `pred`, pruning as it goes.
    fn drain(&mut self, pred: &dyn Fn(&Arc<MatchRule>) -> bool, out: &mut Vec<Arc<MatchRule>>) {
        self.rules.retain(|rule| {
            if pred(rule) {
                out.push(Arc::clone(rule));
                false
            } else {
                true
            }
        });
        if let Some(child) = self.wildcard.as_mut() {
            child.drain(pred, out);
            if child.is_empty() {
                self.wildcard = None;
            }
        }
        self.exact.retain(|_, child| {
            child.drain(pred, out);
            !child.is_empty()
        });
    }
}

/// Signal subscriptions indexed by sender, interface, member and path.
///
/// Each level keeps a wildcard child for rules that leave the field unset
/// and a map of exact values, so one signal visits at most two children per
/// level no matter how many rules exist.
#[derive(Default)]
pub struct MatchTree {
    root: Node,
    len: usize,
}

impl MatchTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Insert `rule`, keyed on `sender_key` instead of the spec's sender.
    /// The two differ when a well-known sender is tracked by its owner.
    pub fn add(&mut self, sender_key: Option<&str>, rule: Arc<MatchRule>) {
        let levels = rule_levels(sender_key, rule.spec());
        let mut node = &mut self.root;
        for key in levels {
            node = node.child_mut(key);
        }
        node.rules.push(Arc::clone(&rule));
        self.len += 1;
    }

    /// Rules that accept `msg`, in registration order within each leaf.
    pub fn collect_matches(&self, msg: &Message) -> Vec<Arc<MatchRule>> {
        let levels: Levels<'_> = [
            msg.sender(),
            msg.interface(),
            msg.member(),
            msg.path().map(|p| p.as_str()),
        ];
        let mut leaves = Vec::new();
        self.root.collect(&levels, &mut leaves);
        if leaves.is_empty() {
            return Vec::new();
        }
        let args = msg.get_args(ArgOptions::UTF8);
        leaves
            .into_iter()
            .flat_map(|leaf| leaf.rules.iter())
            .filter(|rule| rule.spec().matches_args(&args))
            .cloned()
            .collect()
    }

    /// Remove rules with this spec (and this handler, when given). Removing
    /// rules that are not present is a no-op.
    pub fn remove(
        &mut self,
        sender_key: Option<&str>,
        spec: &MatchSpec,
        handler: Option<&SignalHandler>,
    ) -> Vec<Arc<MatchRule>> {
        let levels = rule_levels(sender_key, spec);
        let mut removed = Vec::new();
        self.root.remove_at(
            &levels,
            &|rule: &Arc<MatchRule>| rule.is_same(spec, handler),
            &mut removed,
        );
        self.len -= removed.len();
        removed
    }

    /// Remove exactly this rule.
    pub fn remove_rule(&mut self, sender_key: Option<&str>, rule: &Arc<MatchRule>) -> bool {
        let levels = rule_levels(sender_key, rule.spec());
        let mut removed = Vec::new();
        self.root.remove_at(
            &levels,
            &|r: &Arc<MatchRule>| Arc::ptr_eq(r, rule),
            &mut removed,
        );
        self.len -= removed.len();
        !removed.is_empty()
    }

    /// Move the rules subscribed to `sender` from under `from` to under
    /// `to`. Returns how many moved.
    pub fn rekey_sender(&mut self, sender: &str, from: &str, to: &str) -> usize {
        if from == to {
            return 0;
        }
        let mut moved = Vec::new();
        if let Some(subtree) = self.root.exact.get_mut(from) {
            subtree.drain(
                &|rule: &Arc<MatchRule>| rule.spec().sender.as_deref() == Some(sender),
                &mut moved,
            );
            if subtree.is_empty() {
                self.root.exact.remove(from);
            }
        }
        self.len -= moved.len();
        let count = moved.len();
        for rule in moved {
            self.add(Some(to), rule);
        }
        count
    }
}
