// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{anyhow, Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    cmp::Ordering,
    fmt::{Debug, Display},
    str::FromStr,
};

pub const VERSION_RE_RAW: &str =
    r"[0-9]+(?:\.[0-9]+)*[a-z]?(?:_(?:alpha|beta|pre|rc|p)[0-9]*)*(?:-r[0-9]+)?";
static VERSION_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("-{}$", VERSION_RE_RAW)).unwrap());

/// A package version, ordered as the Package Manager Specification defines.
///
/// https://projects.gentoo.org/pms/8/pms.html#x1-250003.2
#[derive(Clone, Debug, Hash)]
pub struct Version {
    main: Vec<String>,
    letter: String,
    suffixes: Vec<VersionSuffix>,
    revision: String,
}

impl Version {
    /// Parses `text` into [`Version`].
    ///
    /// [`Version`] also implements [`FromStr`], so `str::parse` works too.
    pub fn try_new(text: &str) -> Result<Self> {
        let (_, ver) = parser::parse_version(text).map_err(|e| e.to_owned())?;
        Ok(ver)
    }

    /// Extracts a version suffix from `input` and returns the pair of the
    /// prefix and the [`Version`]. A hyphen must separate the two.
    ///
    /// # Example
    ///
    /// ```
    /// # use version::Version;
    /// assert_eq!(("sys-apps/attr", Version::try_new("2.5.1")?), Version::from_str_suffix("sys-apps/attr-2.5.1")?);
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn from_str_suffix(input: &str) -> Result<(&str, Self)> {
        let caps = VERSION_SUFFIX_RE
            .captures(input)
            .ok_or_else(|| anyhow!("invalid version number"))?;
        let ver = Self::try_new(&caps[0][1..])?;
        Ok((&input[..caps.get(0).unwrap().start()], ver))
    }

    /// Returns the revision part of the version, or the empty string when
    /// there is none.
    pub fn revision(&self) -> &str {
        &self.revision
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Version::try_new(text)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.main[0])?;
        for v in self.main[1..].iter() {
            write!(f, ".{}", v)?;
        }
        write!(f, "{}", self.letter)?;
        for suffix in self.suffixes.iter() {
            write!(f, "{}", suffix.label)?;
            if !suffix.number.is_empty() {
                write!(f, "{}", suffix.number)?;
            }
        }
        if !self.revision.is_empty() {
            write!(f, "-r{}", self.revision)?;
        }
        Ok(())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    /// Compares two versions per Algorithm 3.1 in PMS:
    /// https://projects.gentoo.org/pms/8/pms.html#x1-260003.3
    fn cmp(&self, other: &Self) -> Ordering {
        let major_cmp = compare_generic_number_strings(&self.main[0], &other.main[0]);
        if major_cmp != Ordering::Equal {
            return major_cmp;
        }

        let n = self.main.len().min(other.main.len());
        let post_major_cmp = self.main[1..n]
            .iter()
            .zip(other.main[1..n].iter())
            .map(|(a, b)| compare_post_major_version_strings(a, b))
            .fold(Ordering::Equal, Ordering::then);
        if post_major_cmp != Ordering::Equal {
            return post_major_cmp;
        }

        let main_len_cmp = self.main.len().cmp(&other.main.len());
        if main_len_cmp != Ordering::Equal {
            return main_len_cmp;
        }

        let letter_cmp = self.letter.cmp(&other.letter);
        if letter_cmp != Ordering::Equal {
            return letter_cmp;
        }

        let m = self.suffixes.len().min(other.suffixes.len());
        let suffixes_cmp = self.suffixes[..m]
            .iter()
            .zip(other.suffixes[..m].iter())
            .map(|(a, b)| a.cmp(b))
            .fold(Ordering::Equal, Ordering::then);
        if suffixes_cmp != Ordering::Equal {
            return suffixes_cmp;
        }

        // A trailing _p suffix sorts above the bare version; any other
        // trailing suffix sorts below it.
        if self.suffixes.len() > other.suffixes.len() {
            return if self.suffixes[self.suffixes.len() - 1].label == VersionSuffixLabel::P {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }
        if self.suffixes.len() < other.suffixes.len() {
            return if other.suffixes[other.suffixes.len() - 1].label == VersionSuffixLabel::P {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }

        compare_generic_number_strings(&self.revision, &other.revision)
    }
}

/// A version suffix, such as "_alpha42".
#[derive(Clone, Debug, Hash)]
pub struct VersionSuffix {
    label: VersionSuffixLabel,
    number: String,
}

impl Display for VersionSuffix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.label, self.number)
    }
}

impl PartialEq for VersionSuffix {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VersionSuffix {}

impl PartialOrd for VersionSuffix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionSuffix {
    fn cmp(&self, other: &Self) -> Ordering {
        let label_cmp = self.label.cmp(&other.label);
        if label_cmp != Ordering::Equal {
            return label_cmp;
        }
        compare_generic_number_strings(&self.number, &other.number)
    }
}

/// Version suffix labels, in ascending order of precedence.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    strum_macros::AsRefStr,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum VersionSuffixLabel {
    #[strum(serialize = "_alpha")]
    Alpha,
    #[strum(serialize = "_beta")]
    Beta,
    #[strum(serialize = "_pre")]
    Pre,
    #[strum(serialize = "_rc")]
    Rc,
    #[strum(serialize = "_p")]
    P,
}

/// Compares two numeric strings without parsing them into integers, so that
/// arbitrarily long components survive.
fn compare_generic_number_strings(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    if a.len() != b.len() {
        return a.len().cmp(&b.len());
    }
    a.cmp(b)
}

/// Compares post-major numeric components: a component with a leading zero
/// compares as a fractional part (Algorithm 3.3 in PMS).
fn compare_post_major_version_strings(a: &str, b: &str) -> Ordering {
    if a.starts_with('0') || b.starts_with('0') {
        return a.trim_end_matches('0').cmp(b.trim_end_matches('0'));
    }
    compare_generic_number_strings(a, b)
}

mod parser {
    use super::*;
    use nom::{
        branch::alt,
        bytes::complete::tag,
        character::complete::{char, digit0, digit1, one_of},
        combinator::{eof, opt},
        multi::many0,
        sequence::preceded,
        IResult,
    };

    fn parse_main(input: &str) -> IResult<&str, Vec<String>> {
        let (input, major) = digit1(input)?;
        let (input, post_major) = many0(preceded(char('.'), digit1))(input)?;
        let mut main = vec![major.to_owned()];
        main.extend(post_major.into_iter().map(|s| s.to_owned()));
        Ok((input, main))
    }

    fn parse_letter(input: &str) -> IResult<&str, String> {
        let (input, letter) = opt(one_of("abcdefghijklmnopqrstuvwxyz"))(input)?;
        let letter = letter.map(|c| c.to_string()).unwrap_or_default();
        Ok((input, letter))
    }

    fn parse_suffix(input: &str) -> IResult<&str, VersionSuffix> {
        let (input, label) = alt((
            tag(VersionSuffixLabel::Alpha.as_ref()),
            tag(VersionSuffixLabel::Beta.as_ref()),
            tag(VersionSuffixLabel::Pre.as_ref()),
            tag(VersionSuffixLabel::Rc.as_ref()),
            tag(VersionSuffixLabel::P.as_ref()),
        ))(input)?;
        let (input, number) = digit0(input)?;
        Ok((
            input,
            VersionSuffix {
                label: label.parse().unwrap(),
                number: number.to_owned(),
            },
        ))
    }

    fn parse_suffixes(input: &str) -> IResult<&str, Vec<VersionSuffix>> {
        many0(parse_suffix)(input)
    }

    fn parse_revision(input: &str) -> IResult<&str, String> {
        let (input, revision) = opt(preceded(tag("-r"), digit1))(input)?;
        let revision = revision.map(|s| s.to_owned()).unwrap_or_default();
        Ok((input, revision))
    }

    pub(super) fn parse_version(input: &str) -> IResult<&str, Version> {
        let (input, main) = parse_main(input)?;
        let (input, letter) = parse_letter(input)?;
        let (input, suffixes) = parse_suffixes(input)?;
        let (input, revision) = parse_revision(input)?;
        let (input, _) = eof(input)?;
        Ok((
            input,
            Version {
                main,
                letter,
                suffixes,
                revision,
            },
        ))
    }
}
