//! Typed AppArmor template.
//!
//! A template is ordinary AppArmor policy written against unqualified base
//! names (`profile containai-agent`, `peer=containai-proxy`). Parsing splits
//! it into verbatim text and the name-bearing tokens, so rendering for a
//! channel rewrites exactly those tokens and nothing else. The rendered
//! output is parsed again and checked before it is accepted.

use std::collections::BTreeSet;

use crate::channel::Channel;
use crate::error::{SecurityError, SecurityResult};
use crate::profiles::{qualify, REQUIRED_BASES};

const PROFILE_KEYWORD: &str = "profile";
const PEER_PREFIX: &str = "peer=";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Declaration,
    Peer(String),
}

/// Parsed AppArmor template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppArmorTemplate {
    name: String,
    segments: Vec<Segment>,
}

/// Characters allowed in a profile name.
pub fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}

impl AppArmorTemplate {
    /// Parse template text.
    ///
    /// Exactly one `profile <name>` declaration is required. `peer=`
    /// references are tracked when they name a required base or the
    /// declared profile itself; other peers (`unconfined`, ...) stay text.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::Configuration`] when the declaration is
    /// missing, repeated or has an invalid name.
    pub fn parse(text: &str) -> SecurityResult<Self> {
        let name = find_declaration(text)?;
        let known: BTreeSet<&str> = REQUIRED_BASES
            .iter()
            .copied()
            .chain(std::iter::once(name.as_str()))
            .collect();

        let mut segments = Vec::new();
        let mut buf = String::new();
        let mut declared = false;
        for line in text.split_inclusive('\n') {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') {
                buf.push_str(line);
                continue;
            }
            let mut rest = line;
            if !declared && starts_with_keyword(trimmed) {
                if let Some((before, after)) = split_declaration(line) {
                    buf.push_str(before);
                    flush(&mut buf, &mut segments);
                    segments.push(Segment::Declaration);
                    declared = true;
                    rest = after;
                }
            }
            scan_peers(rest, &known, &mut buf, &mut segments);
        }
        flush(&mut buf, &mut segments);

        Ok(Self { name, segments })
    }

    /// Declared profile name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tracked `peer=` references.
    pub fn peer_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Peer(_)))
            .count()
    }

    /// Render for `channel` and validate the result.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::Configuration`] if the rendered profile does
    /// not re-parse to the qualified declaration with every tracked
    /// reference qualified.
    pub fn render(&self, channel: Channel) -> SecurityResult<String> {
        let rendered = self.render_unchecked(channel);
        self.validate_rendered(&rendered, channel)?;
        Ok(rendered)
    }

    fn render_unchecked(&self, channel: Channel) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Declaration => out.push_str(&qualify(&self.name, channel)),
                Segment::Peer(peer) => out.push_str(&qualify(peer, channel)),
            }
        }
        out
    }

    fn validate_rendered(&self, rendered: &str, channel: Channel) -> SecurityResult<()> {
        let qualified_name = qualify(&self.name, channel);
        let reparsed = Self::parse(rendered)?;
        if reparsed.name != qualified_name {
            return Err(SecurityError::config(format!(
                "rendered profile declares {:?}, expected {qualified_name:?}",
                reparsed.name
            )));
        }

        let unqualified: BTreeSet<&str> = REQUIRED_BASES
            .iter()
            .copied()
            .chain(std::iter::once(self.name.as_str()))
            .collect();
        let qualified: BTreeSet<String> = unqualified.iter().map(|b| qualify(b, channel)).collect();

        let peers = peer_names(rendered);
        if let Some(stale) = peers.iter().find(|p| unqualified.contains(**p)) {
            return Err(SecurityError::config(format!(
                "rendered profile {qualified_name} still references unqualified {stale}"
            )));
        }
        let rendered_refs = peers.iter().filter(|p| qualified.contains(**p)).count();
        if rendered_refs != self.peer_count() {
            return Err(SecurityError::config(format!(
                "rendered profile {qualified_name} has {rendered_refs} peer references, \
                 template has {}",
                self.peer_count()
            )));
        }
        Ok(())
    }
}

fn starts_with_keyword(trimmed: &str) -> bool {
    trimmed
        .strip_prefix(PROFILE_KEYWORD)
        .and_then(|rest| rest.chars().next())
        .is_some_and(char::is_whitespace)
}

/// Split a declaration line around its name: `(text up to the name, text after)`.
fn split_declaration(line: &str) -> Option<(&str, &str)> {
    let keyword_at = line.find(PROFILE_KEYWORD)?;
    let (lead, from_keyword) = line.split_at(keyword_at);
    let after_keyword = from_keyword.strip_prefix(PROFILE_KEYWORD)?;
    let name_at = after_keyword.find(|c: char| !c.is_whitespace())?;
    let (gap, from_name) = after_keyword.split_at(name_at);
    let name_len = from_name
        .find(|c: char| !is_name_char(c))
        .unwrap_or(from_name.len());
    let (_, tail) = from_name.split_at(name_len);
    let head_len = lead
        .len()
        .checked_add(PROFILE_KEYWORD.len())?
        .checked_add(gap.len())?;
    let (head, _) = line.split_at(head_len);
    Some((head, tail))
}

fn find_declaration(text: &str) -> SecurityResult<String> {
    let mut names = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') || !starts_with_keyword(trimmed) {
            continue;
        }
        let name: String = trimmed
            .trim_start_matches(PROFILE_KEYWORD)
            .trim_start()
            .chars()
            .take_while(|c| is_name_char(*c))
            .collect();
        if name.is_empty() {
            return Err(SecurityError::config(format!(
                "invalid profile declaration: {:?}",
                line.trim()
            )));
        }
        names.push(name);
    }
    match names.len() {
        0 => Err(SecurityError::config(
            "template has no `profile <name>` declaration",
        )),
        1 => Ok(names.swap_remove(0)),
        _ => Err(SecurityError::config(format!(
            "template declares more than one profile: {}",
            names.join(", ")
        ))),
    }
}

fn scan_peers(mut rest: &str, known: &BTreeSet<&str>, buf: &mut String, segments: &mut Vec<Segment>) {
    while let Some(at) = rest.find(PEER_PREFIX) {
        let (before, from_peer) = rest.split_at(at);
        buf.push_str(before);
        buf.push_str(PEER_PREFIX);
        let after = from_peer.strip_prefix(PEER_PREFIX).unwrap_or(from_peer);
        let name_len = after.find(|c: char| !is_name_char(c)).unwrap_or(after.len());
        let (name, tail) = after.split_at(name_len);
        if known.contains(name) {
            flush(buf, segments);
            segments.push(Segment::Peer(name.to_owned()));
        } else {
            buf.push_str(name);
        }
        rest = tail;
    }
    buf.push_str(rest);
}

fn peer_names(text: &str) -> Vec<&str> {
    let mut names = Vec::new();
    for line in text.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        let mut rest = line;
        while let Some(at) = rest.find(PEER_PREFIX) {
            let (_, from_peer) = rest.split_at(at);
            let after = from_peer.strip_prefix(PEER_PREFIX).unwrap_or(from_peer);
            let name_len = after.find(|c: char| !is_name_char(c)).unwrap_or(after.len());
            let (name, tail) = after.split_at(name_len);
            names.push(name);
            rest = tail;
        }
    }
    names
}

fn flush(buf: &mut String, segments: &mut Vec<Segment>) {
    if !buf.is_empty() {
        segments.push(Segment::Text(std::mem::take(buf)));
    }
}
