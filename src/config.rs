//! Capability declarations: config-file parsing, built-in defaults, and
//! environment resolution.
//!
//! The declaration file is line-oriented:
//!
//! ```text
//! # one slot per line, in table order
//! policy,requesterWinsPriorityTie
//! video,hardware
//! video,hardware,limitedResolution(640,480)
//! audio,hardware
//! frontend
//! ```
//!
//! Keywords are separated by commas or spaces. `limitedResolution(W,H)`
//! attaches a resolution ceiling and is only valid for video. A class with
//! no lines keeps its built-in default table; a file that fails to parse is
//! ignored entirely (the caller logs and falls back to the defaults).

use crate::caps::{CapFlags, ResClass, SizeLimit, SlotCaps};
use crate::error::{Error, Result};
use crate::layout::MAX_SLOTS;
use std::path::PathBuf;
use winnow::Parser;
use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, delimited, opt, preceded, repeat};
use winnow::error::ContextError;
use winnow::token::take_while;

type WResult<T> = std::result::Result<T, ContextError>;

/// Environment variable naming the runtime directory for the control and
/// lock files. Falls back to `XDG_RUNTIME_DIR`.
pub const ENV_RUNTIME_DIR: &str = "RESARB_RUNTIME_DIR";

/// Standard runtime-directory variable, used when [`ENV_RUNTIME_DIR`] is
/// not set.
pub const ENV_XDG_RUNTIME_DIR: &str = "XDG_RUNTIME_DIR";

/// Environment variable overriding the declaration file path.
pub const ENV_CONFIG_PATH: &str = "RESARB_CONFIG";

/// Default declaration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/default/resarb.conf";

/// Control-file name inside the runtime directory.
pub(crate) const CONTROL_FILE_NAME: &str = "resarb-data";

/// Lock-file name inside the runtime directory.
pub(crate) const LOCK_FILE_NAME: &str = "resarb-lock";

/// Resolve the runtime directory holding the control and lock files.
///
/// Errors with [`Error::StoreUnavailable`] when neither variable is set;
/// there is deliberately no `/tmp` fallback, matching the expectation that
/// the device provides a per-boot runtime directory.
pub(crate) fn runtime_dir() -> Result<PathBuf> {
    for var in [ENV_RUNTIME_DIR, ENV_XDG_RUNTIME_DIR] {
        if let Ok(dir) = std::env::var(var) {
            if !dir.is_empty() {
                return Ok(PathBuf::from(dir));
            }
        }
    }
    Err(Error::StoreUnavailable(format!(
        "runtime directory not configured ({ENV_RUNTIME_DIR} or {ENV_XDG_RUNTIME_DIR})"
    )))
}

/// Resolve the declaration file path.
pub(crate) fn config_path() -> PathBuf {
    match std::env::var(ENV_CONFIG_PATH) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

// ============================================================================
// Configuration table
// ============================================================================

/// Capability tables and policy flags used to initialize (or reset) the
/// control file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbConfig {
    /// Tie-break policy: a requester at equal priority and usage preempts
    /// the current owner.
    pub requester_wins_priority_tie: bool,
    /// Video decoder slots, in table order.
    pub video: Vec<SlotCaps>,
    /// Audio decoder slots, in table order.
    pub audio: Vec<SlotCaps>,
    /// Front-end (tuner) slots, in table order.
    pub front_end: Vec<SlotCaps>,
}

impl ArbConfig {
    /// The hard-coded table used when no declaration file is available.
    pub fn builtin_defaults() -> Self {
        Self {
            requester_wins_priority_tie: false,
            video: vec![
                SlotCaps::new(CapFlags::HARDWARE),
                SlotCaps::limited(CapFlags::HARDWARE, 640, 480),
            ],
            audio: vec![
                SlotCaps::new(CapFlags::HARDWARE),
                SlotCaps::new(CapFlags::HARDWARE),
            ],
            front_end: vec![SlotCaps::new(CapFlags::empty())],
        }
    }

    /// Capability table for one class.
    pub fn class_table(&self, class: ResClass) -> &[SlotCaps] {
        match class {
            ResClass::Video => &self.video,
            ResClass::Audio => &self.audio,
            ResClass::FrontEnd => &self.front_end,
        }
    }

    /// Parse a declaration file.
    ///
    /// Classes with no declarations keep their built-in default tables, so
    /// a partial file only overrides what it names.
    pub fn parse(text: &str) -> Result<Self> {
        let mut tie = false;
        let mut tables: [Vec<SlotCaps>; 3] = [Vec::new(), Vec::new(), Vec::new()];

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let item = config_line.parse(line).map_err(|e| {
                Error::BadArgument(format!("declaration line {}: {e}", lineno + 1))
            })?;
            match item {
                LineItem::Policy(tokens) => {
                    for token in tokens {
                        match token {
                            PolicyToken::RequesterWinsTie => tie = true,
                        }
                    }
                }
                LineItem::Slot(class, tokens) => {
                    let caps = build_slot_caps(class, &tokens).map_err(|msg| {
                        Error::BadArgument(format!("declaration line {}: {msg}", lineno + 1))
                    })?;
                    let table = &mut tables[class.index()];
                    if table.len() >= MAX_SLOTS {
                        return Err(Error::BadArgument(format!(
                            "declaration line {}: more than {MAX_SLOTS} {class} slots",
                            lineno + 1
                        )));
                    }
                    table.push(caps);
                }
            }
        }

        let defaults = Self::builtin_defaults();
        let [video, audio, front_end] = tables;
        Ok(Self {
            requester_wins_priority_tie: tie,
            video: if video.is_empty() { defaults.video } else { video },
            audio: if audio.is_empty() { defaults.audio } else { audio },
            front_end: if front_end.is_empty() {
                defaults.front_end
            } else {
                front_end
            },
        })
    }

    /// Load the declaration file named by the environment, falling back to
    /// the built-in defaults on absence or parse failure. Never fails.
    pub fn load() -> Self {
        let path = config_path();
        match std::fs::read_to_string(&path) {
            Ok(text) => match Self::parse(&text) {
                Ok(config) => {
                    tracing::debug!(path = %path.display(), "loaded resource declarations");
                    config
                }
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "declaration file rejected, using built-in defaults"
                    );
                    Self::builtin_defaults()
                }
            },
            Err(err) => {
                tracing::debug!(
                    path = %path.display(),
                    error = %err,
                    "no declaration file, using built-in defaults"
                );
                Self::builtin_defaults()
            }
        }
    }
}

impl Default for ArbConfig {
    fn default() -> Self {
        Self::builtin_defaults()
    }
}

// ============================================================================
// Line grammar
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum LineItem {
    Policy(Vec<PolicyToken>),
    Slot(ResClass, Vec<CapToken>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PolicyToken {
    RequesterWinsTie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapToken {
    Flag(CapFlags),
    Limited(SizeLimit),
}

/// Fold keyword tokens into one slot declaration, checking class validity.
fn build_slot_caps(class: ResClass, tokens: &[CapToken]) -> std::result::Result<SlotCaps, String> {
    let mut flags = CapFlags::empty();
    let mut limit = None;
    for token in tokens {
        match token {
            CapToken::Flag(f) => {
                if !class.criteria_mask().contains(*f)
                    && f.intersects(
                        CapFlags::LIMITED_QUALITY
                            | CapFlags::LIMITED_PERFORMANCE
                            | CapFlags::LIMITED_RESOLUTION,
                    )
                {
                    return Err(format!("limited capability not valid for {class}"));
                }
                flags |= *f;
            }
            CapToken::Limited(size) => {
                if class != ResClass::Video {
                    return Err(format!("limitedResolution not valid for {class}"));
                }
                flags |= CapFlags::LIMITED_RESOLUTION;
                limit = Some(*size);
            }
        }
    }
    Ok(SlotCaps { flags, limit })
}

/// Parse one non-blank line: a policy declaration or a slot declaration.
fn config_line(input: &mut &str) -> WResult<LineItem> {
    let item = alt((policy_line, slot_line)).parse_next(input)?;
    let _ = opt(list_sep).parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    if !input.is_empty() {
        return Err(ContextError::new());
    }
    Ok(item)
}

fn policy_line(input: &mut &str) -> WResult<LineItem> {
    let _ = "policy".parse_next(input)?;
    let tokens: Vec<PolicyToken> =
        repeat(1.., preceded(list_sep, policy_keyword)).parse_next(input)?;
    Ok(LineItem::Policy(tokens))
}

fn policy_keyword(input: &mut &str) -> WResult<PolicyToken> {
    "requesterWinsPriorityTie"
        .map(|_| PolicyToken::RequesterWinsTie)
        .parse_next(input)
}

fn slot_line(input: &mut &str) -> WResult<LineItem> {
    let class = class_name.parse_next(input)?;
    let tokens: Vec<CapToken> = repeat(0.., preceded(list_sep, cap_keyword)).parse_next(input)?;
    Ok(LineItem::Slot(class, tokens))
}

fn class_name(input: &mut &str) -> WResult<ResClass> {
    alt((
        "video".map(|_| ResClass::Video),
        "audio".map(|_| ResClass::Audio),
        "frontend".map(|_| ResClass::FrontEnd),
    ))
    .parse_next(input)
}

/// Keyword separator: one or more commas, spaces, or tabs.
fn list_sep(input: &mut &str) -> WResult<()> {
    let _ = take_while(1.., |c: char| c == ',' || c == ' ' || c == '\t').parse_next(input)?;
    Ok(())
}

fn cap_keyword(input: &mut &str) -> WResult<CapToken> {
    alt((
        limited_resolution,
        "limitedQuality".map(|_| CapToken::Flag(CapFlags::LIMITED_QUALITY)),
        "limitedPerformance".map(|_| CapToken::Flag(CapFlags::LIMITED_PERFORMANCE)),
        "hardware".map(|_| CapToken::Flag(CapFlags::HARDWARE)),
        "software".map(|_| CapToken::Flag(CapFlags::SOFTWARE)),
    ))
    .parse_next(input)
}

/// `limitedResolution(W,H)` with optional interior whitespace.
fn limited_resolution(input: &mut &str) -> WResult<CapToken> {
    let _ = "limitedResolution".parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    let (width, height) = delimited('(', resolution_pair, ')').parse_next(input)?;
    Ok(CapToken::Limited(SizeLimit::new(width, height)))
}

fn resolution_pair(input: &mut &str) -> WResult<(u32, u32)> {
    let _ = multispace0.parse_next(input)?;
    let width = dimension.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    let _ = ','.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    let height = dimension.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    Ok((width, height))
}

fn dimension(input: &mut &str) -> WResult<u32> {
    digit1.parse_to().parse_next(input)
}
