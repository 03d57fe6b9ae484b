// Copyright © 2020 Intel Corporation
// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Parser for `key=value,key=value` option strings.

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

mod private_trait {
    // Dispatches to `FromStr::from_str` on externally-defined types and to
    // custom parsing code for types in this module. Values reaching it have
    // already gone through split_commas, so quotes are balanced.
    pub trait Parseable
    where
        Self: Sized,
    {
        type Err;
        fn from_str(input: &str) -> Result<Self, <Self as Parseable>::Err>;
    }
}
use private_trait::Parseable;

#[derive(Default)]
pub struct OptionParser {
    options: HashMap<String, OptionParserValue>,
}

struct OptionParserValue {
    value: Option<String>,
}

#[derive(Error, Debug)]
pub enum OptionParserError {
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unable to convert {1} for {0}")]
    Conversion(String /* field */, String /* value */),
}
type OptionParserResult<T> = std::result::Result<T, OptionParserError>;

fn split_commas(s: &str) -> OptionParserResult<Vec<String>> {
    let mut list: Vec<String> = Vec::new();
    let mut in_quotes = false;
    let mut current = String::new();

    for c in s.trim().chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                list.push(current);
                current = String::new();
                continue;
            }
            _ => {}
        };
        current.push(c);
    }
    list.push(current);

    if in_quotes {
        return Err(OptionParserError::InvalidSyntax(s.to_owned()));
    }

    Ok(list)
}

impl OptionParser {
    pub fn new() -> Self {
        Self {
            options: HashMap::new(),
        }
    }

    pub fn parse(&mut self, input: &str) -> OptionParserResult<()> {
        if input.trim().is_empty() {
            return Ok(());
        }

        for option in split_commas(input)?.iter() {
            let parts: Vec<&str> = option.splitn(2, '=').collect();
            match self.options.get_mut(parts[0]) {
                None => return Err(OptionParserError::UnknownOption(parts[0].to_owned())),
                Some(value) => {
                    if parts.len() != 2 {
                        return Err(OptionParserError::InvalidSyntax((*option).to_owned()));
                    }
                    value.value = Some(parts[1].trim().to_owned());
                }
            }
        }

        Ok(())
    }

    pub fn add(&mut self, option: &str) -> &mut Self {
        assert!(
            !option.contains(['"', '=', ',']),
            "forbidden character in option name"
        );
        self.options.insert(option.to_owned(), OptionParserValue { value: None });

        self
    }

    pub fn get(&self, option: &str) -> Option<String> {
        self.options
            .get(option)
            .and_then(|v| v.value.clone())
            .and_then(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(dequote(&s))
                }
            })
    }

    pub fn convert<T: Parseable>(&self, option: &str) -> OptionParserResult<Option<T>> {
        match self.options.get(option).and_then(|v| v.value.as_ref()) {
            None => Ok(None),
            Some(v) => Ok(if v.is_empty() {
                None
            } else {
                Some(Parseable::from_str(v).map_err(|_| {
                    OptionParserError::Conversion(option.to_owned(), v.to_owned())
                })?)
            }),
        }
    }
}

/// A byte count with an optional `K`, `M` or `G` suffix.
pub struct ByteSized(pub u64);

#[derive(Error, Debug)]
pub enum ByteSizedParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl FromStr for ByteSized {
    type Err = ByteSizedParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let shift = if s.ends_with('K') {
            10
        } else if s.ends_with('M') {
            20
        } else if s.ends_with('G') {
            30
        } else {
            0
        };

        let digits = s.trim_end_matches(['K', 'M', 'G']);
        let value = digits
            .parse::<u64>()
            .map_err(|_| ByteSizedParseError::InvalidValue(s.to_owned()))?;
        value
            .checked_mul(1 << shift)
            .map(ByteSized)
            .ok_or_else(|| ByteSizedParseError::InvalidValue(s.to_owned()))
    }
}

fn dequote(s: &str) -> String {
    let mut prev_byte = b'\0';
    let mut in_quotes = false;
    let mut out: Vec<u8> = vec![];
    for i in s.bytes() {
        if i == b'"' {
            if prev_byte == b'"' && !in_quotes {
                out.push(b'"');
            }
            in_quotes = !in_quotes;
        } else {
            out.push(i);
        }
        prev_byte = i
    }
    assert!(!in_quotes, "split_commas didn't reject unbalanced quotes");
    // SAFETY: the non-ASCII bytes in the output are the same
    // and in the same order as those in the input, so if the
    // input is valid UTF-8 the output will be as well.
    unsafe { String::from_utf8_unchecked(out) }
}

impl<T> Parseable for T
where
    T: FromStr + Sized,
{
    type Err = <T as FromStr>::Err;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        dequote(s).parse()
    }
}
