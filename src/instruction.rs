//! src/instruction.rs
//!
//! The test script grammar. Every non-blank line is one instruction: commas
//! are stripped, the line is split on whitespace, the first token names the
//! command and the rest are its arguments. Each command's arguments are
//! validated and typed here, so the engine never sees a malformed line.

use crate::error::{Error, Result};
use std::{fmt, str::FromStr};

/// A parsed script line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    /// The source line as written (before comma stripping).
    pub line: String,
    /// 1-based line number, also the TAP test number.
    pub index: usize,
}

/// Sequence number half of a `<name>@<seqno|latest>` argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Seqno {
    Latest,
    At(u64),
}

/// `<name>@<seqno|latest>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeqnoTarget {
    pub name: String,
    pub seqno: Seqno,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// `comment ...` or `# ...`
    Comment { text: String },
    Enter { name: String },
    Load { name: String, id: String },
    SkipOffset { name: String },
    AllOffsets { name: String },
    Hops { name: String, hops: usize },
    Caps { name: String, caps: String },
    Start { name: String, implementation: String },
    Stop { name: String },
    Log { name: String, count: usize },
    Wait { ms: u64 },
    WaitUntil { src: String, target: SeqnoTarget },
    Follow { src: String, dst: String },
    Unfollow { src: String, dst: String },
    IsFollowing { src: String, dst: String },
    IsNotFollowing { src: String, dst: String },
    Post { name: String },
    Publish { name: String, content: String },
    Connect { src: String, dst: String },
    Disconnect { src: String, dst: String },
    Has { src: String, target: SeqnoTarget },
}

impl Op {
    pub fn command(&self) -> &'static str {
        match self {
            Op::Comment { .. } => "comment",
            Op::Enter { .. } => "enter",
            Op::Load { .. } => "load",
            Op::SkipOffset { .. } => "skipoffset",
            Op::AllOffsets { .. } => "alloffsets",
            Op::Hops { .. } => "hops",
            Op::Caps { .. } => "caps",
            Op::Start { .. } => "start",
            Op::Stop { .. } => "stop",
            Op::Log { .. } => "log",
            Op::Wait { .. } => "wait",
            Op::WaitUntil { .. } => "waituntil",
            Op::Follow { .. } => "follow",
            Op::Unfollow { .. } => "unfollow",
            Op::IsFollowing { .. } => "isfollowing",
            Op::IsNotFollowing { .. } => "isnotfollowing",
            Op::Post { .. } => "post",
            Op::Publish { .. } => "publish",
            Op::Connect { .. } => "connect",
            Op::Disconnect { .. } => "disconnect",
            Op::Has { .. } => "has",
        }
    }

    /// Positional arguments in script order.
    pub fn args(&self) -> Vec<String> {
        match self {
            Op::Comment { text } => text.split_whitespace().map(str::to_string).collect(),
            Op::Enter { name }
            | Op::SkipOffset { name }
            | Op::AllOffsets { name }
            | Op::Stop { name }
            | Op::Post { name } => vec![name.clone()],
            Op::Load { name, id } => vec![name.clone(), id.clone()],
            Op::Hops { name, hops } => vec![name.clone(), hops.to_string()],
            Op::Caps { name, caps } => vec![name.clone(), caps.clone()],
            Op::Start { name, implementation } => vec![name.clone(), implementation.clone()],
            Op::Log { name, count } => vec![name.clone(), count.to_string()],
            Op::Wait { ms } => vec![ms.to_string()],
            Op::WaitUntil { src, target } | Op::Has { src, target } => {
                vec![src.clone(), target.to_string()]
            }
            Op::Follow { src, dst }
            | Op::Unfollow { src, dst }
            | Op::IsFollowing { src, dst }
            | Op::IsNotFollowing { src, dst }
            | Op::Connect { src, dst }
            | Op::Disconnect { src, dst } => vec![src.clone(), dst.clone()],
            Op::Publish { name, content } => std::iter::once(name.clone())
                .chain(content.split_whitespace().map(str::to_string))
                .collect(),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())?;
        for arg in self.args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Seqno::Latest => f.write_str("latest"),
            Seqno::At(n) => write!(f, "{n}"),
        }
    }
}

impl fmt::Display for SeqnoTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.seqno)
    }
}

impl FromStr for Seqno {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        if s == "latest" {
            return Ok(Seqno::Latest);
        }
        s.parse()
            .map(Seqno::At)
            .map_err(|_| format!("expected `latest` or a sequence number, got `{s}`"))
    }
}

/// Parses a whole script. Any blank line or malformed instruction rejects
/// the script.
pub fn parse_script(text: &str) -> Result<Vec<Instruction>> {
    let text = text.trim_end_matches(['\n', '\r']);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    text.lines()
        .enumerate()
        .map(|(i, line)| parse_line(line, i + 1))
        .collect()
}

pub fn parse_line(line: &str, index: usize) -> Result<Instruction> {
    let line = line.trim();
    if line.is_empty() {
        return Err(Error::parse(
            index,
            format!("line {index} was empty; empty lines are not allowed"),
        ));
    }
    let stripped = line.replace(',', "");
    let mut tokens = stripped.split_whitespace();
    let command = tokens.next().unwrap_or_default();
    let args = Args {
        command,
        index,
        tokens: tokens.collect(),
    };
    let op = args.into_op()?;
    Ok(Instruction {
        op,
        line: line.to_string(),
        index,
    })
}

struct Args<'a> {
    command: &'a str,
    index: usize,
    tokens: Vec<&'a str>,
}

impl Args<'_> {
    fn get(&self, n: usize) -> Result<String> {
        self.tokens.get(n).map(|s| s.to_string()).ok_or_else(|| {
            let ordinal = match n {
                0 => "first",
                1 => "second",
                _ => "an",
            };
            Error::parse(
                self.index,
                format!("{} was missing its {ordinal} argument", self.command),
            )
        })
    }

    fn number<T: FromStr>(&self, n: usize) -> Result<T> {
        let raw = self.get(n)?;
        raw.parse().map_err(|_| {
            Error::parse(
                self.index,
                format!("{}: `{raw}` is not a valid number", self.command),
            )
        })
    }

    fn target(&self, n: usize) -> Result<SeqnoTarget> {
        let raw = self.get(n)?;
        let (name, seqno) = raw.split_once('@').ok_or_else(|| {
            Error::parse(
                self.index,
                format!("{} statement was missing @<seqno> ({raw})", self.command),
            )
        })?;
        let seqno = seqno
            .parse()
            .map_err(|reason| Error::parse(self.index, format!("{}: {reason}", self.command)))?;
        Ok(SeqnoTarget {
            name: name.to_string(),
            seqno,
        })
    }

    fn rest(&self, from: usize) -> String {
        self.tokens.get(from..).unwrap_or_default().join(" ")
    }

    fn into_op(self) -> Result<Op> {
        let op = match self.command {
            "#" | "comment" => Op::Comment { text: self.rest(0) },
            "enter" => Op::Enter { name: self.get(0)? },
            "load" => Op::Load {
                name: self.get(0)?,
                id: self.get(1)?,
            },
            "skipoffset" => Op::SkipOffset { name: self.get(0)? },
            "alloffsets" => Op::AllOffsets { name: self.get(0)? },
            "hops" => Op::Hops {
                name: self.get(0)?,
                hops: self.number(1)?,
            },
            "caps" => Op::Caps {
                name: self.get(0)?,
                caps: self.get(1)?,
            },
            "start" => Op::Start {
                name: self.get(0)?,
                implementation: self.get(1)?,
            },
            "stop" => Op::Stop { name: self.get(0)? },
            "log" => Op::Log {
                name: self.get(0)?,
                count: self.number(1)?,
            },
            "wait" => Op::Wait { ms: self.number(0)? },
            "waituntil" => Op::WaitUntil {
                src: self.get(0)?,
                target: self.target(1)?,
            },
            "follow" => Op::Follow {
                src: self.get(0)?,
                dst: self.get(1)?,
            },
            "unfollow" => Op::Unfollow {
                src: self.get(0)?,
                dst: self.get(1)?,
            },
            "isfollowing" => Op::IsFollowing {
                src: self.get(0)?,
                dst: self.get(1)?,
            },
            "isnotfollowing" => Op::IsNotFollowing {
                src: self.get(0)?,
                dst: self.get(1)?,
            },
            "post" => Op::Post { name: self.get(0)? },
            "publish" => Op::Publish {
                name: self.get(0)?,
                content: self.rest(1),
            },
            "connect" => Op::Connect {
                src: self.get(0)?,
                dst: self.get(1)?,
            },
            "disconnect" => Op::Disconnect {
                src: self.get(0)?,
                dst: self.get(1)?,
            },
            "has" => Op::Has {
                src: self.get(0)?,
                target: self.target(1)?,
            },
            other => {
                return Err(Error::parse(
                    self.index,
                    format!("unknown simulator command `{other}`"),
                ))
            }
        };
        Ok(op)
    }
}
