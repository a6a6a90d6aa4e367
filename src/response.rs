use std::collections::HashMap;

use crate::codec::Frame;
use crate::command::{CommandRecord, ResponseKind};
use crate::error::{Error, FILTER_NOT_FOUND};

const DONE: &str = "Done";
const EXISTS: &str = "Exists";
const YES: &str = "Yes";
const NO: &str = "No";

/// Decoded result of one command, before conversion to the caller-facing
/// type.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Flag(bool),
    Flags(HashMap<String, bool>),
    Filters(Vec<FilterInfo>),
    Info(FilterInfo),
}

impl Value {
    pub(crate) fn into_flag(self) -> Result<bool, Error> {
        match self {
            Value::Flag(flag) => Ok(flag),
            other => Err(mismatch(&other)),
        }
    }

    pub(crate) fn into_flags(self) -> Result<HashMap<String, bool>, Error> {
        match self {
            Value::Flags(flags) => Ok(flags),
            other => Err(mismatch(&other)),
        }
    }

    pub(crate) fn into_filters(self) -> Result<Vec<FilterInfo>, Error> {
        match self {
            Value::Filters(filters) => Ok(filters),
            other => Err(mismatch(&other)),
        }
    }

    pub(crate) fn into_info(self) -> Result<FilterInfo, Error> {
        match self {
            Value::Info(info) => Ok(info),
            other => Err(mismatch(&other)),
        }
    }
}

fn mismatch(value: &Value) -> Error {
    Error::UnexpectedResponse(format!("decoded value of the wrong type: {:?}", value))
}

/// Metadata describing one filter on the server, as reported by `list` and
/// `info`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterInfo {
    pub name: String,
    pub probability: f64,
    pub storage: u64,
    pub capacity: u64,
    pub size: u64,
    pub checks: u64,
    pub check_hits: u64,
    pub check_misses: u64,
    pub sets: u64,
    pub set_hits: u64,
    pub set_misses: u64,
    pub page_ins: u64,
    pub page_outs: u64,
    /// `info` keys this client does not model, preserved verbatim.
    pub extra: HashMap<String, String>,
}

impl FilterInfo {
    /// Parse one `list` block line: `name probability storage capacity size`.
    fn from_list_line(line: &str) -> Result<Self, Error> {
        let mut info = FilterInfo::default();
        let mut tokens = line.split_whitespace();
        info.name = tokens
            .next()
            .ok_or_else(|| bad_list_line(line))?
            .to_string();
        info.probability = parse_token(tokens.next(), line)?;
        info.storage = parse_token(tokens.next(), line)?;
        info.capacity = parse_token(tokens.next(), line)?;
        info.size = parse_token(tokens.next(), line)?;
        Ok(info)
    }

    /// Assign one `info` block line's `snake_case_key value` pair. Unknown
    /// keys and unparsable values land in `extra`.
    fn assign(&mut self, key: &str, value: &str) {
        let slot = match key {
            "storage" => &mut self.storage,
            "capacity" => &mut self.capacity,
            "size" => &mut self.size,
            "checks" => &mut self.checks,
            "check_hits" => &mut self.check_hits,
            "check_misses" => &mut self.check_misses,
            "sets" => &mut self.sets,
            "set_hits" => &mut self.set_hits,
            "set_misses" => &mut self.set_misses,
            "page_ins" => &mut self.page_ins,
            "page_outs" => &mut self.page_outs,
            "probability" => {
                match value.parse() {
                    Ok(probability) => self.probability = probability,
                    Err(_) => {
                        self.extra.insert(key.to_string(), value.to_string());
                    }
                }
                return;
            }
            _ => {
                self.extra.insert(key.to_string(), value.to_string());
                return;
            }
        };
        match value.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => {
                self.extra.insert(key.to_string(), value.to_string());
            }
        }
    }
}

fn bad_list_line(line: &str) -> Error {
    Error::UnexpectedResponse(format!("malformed filter list line: {:?}", line))
}

fn parse_token<T: std::str::FromStr>(token: Option<&str>, line: &str) -> Result<T, Error> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| bad_list_line(line))
}

/// Decode a frame according to the expected response shape of the command
/// it answers.
pub(crate) fn decode(frame: &Frame, record: &CommandRecord) -> Result<Value, Error> {
    match record.kind {
        ResponseKind::Bool => parse_bool(single_line(frame)?).map(Value::Flag),
        ResponseKind::BoolList => decode_bool_list(single_line(frame)?, record.keys()),
        ResponseKind::Confirmation => {
            let line = single_line(frame)?;
            if line == DONE {
                Ok(Value::Flag(true))
            } else {
                Err(Error::Server(line.to_string()))
            }
        }
        ResponseKind::CreateConfirmation => {
            let line = single_line(frame)?;
            // An already-existing filter is as good as a created one.
            if line == DONE || line == EXISTS {
                Ok(Value::Flag(true))
            } else {
                Err(Error::Server(line.to_string()))
            }
        }
        ResponseKind::DropConfirmation => {
            let line = single_line(frame)?;
            // Dropping a filter that is already gone counts as success.
            if line == DONE || line == FILTER_NOT_FOUND {
                Ok(Value::Flag(true))
            } else {
                Err(Error::Server(line.to_string()))
            }
        }
        ResponseKind::FilterList => {
            let lines = block(frame)?;
            let filters = lines
                .iter()
                .map(|line| FilterInfo::from_list_line(line))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Filters(filters))
        }
        ResponseKind::Info => {
            let lines = block(frame)?;
            let mut info = FilterInfo::default();
            info.name = record.filter.clone().unwrap_or_default();
            for line in lines {
                let mut tokens = line.splitn(2, ' ');
                let key = tokens.next().unwrap_or_default();
                let value = tokens.next().unwrap_or_default();
                info.assign(key, value);
            }
            Ok(Value::Info(info))
        }
    }
}

fn parse_bool(line: &str) -> Result<bool, Error> {
    match line {
        YES => Ok(true),
        NO => Ok(false),
        other => Err(Error::Server(other.to_string())),
    }
}

fn decode_bool_list(line: &str, keys: &[String]) -> Result<Value, Error> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != keys.len() {
        return Err(Error::UnexpectedResponse(format!(
            "expected {} booleans, got: {:?}",
            keys.len(),
            line
        )));
    }
    let mut flags = HashMap::with_capacity(keys.len());
    for (key, token) in keys.iter().zip(tokens) {
        match token {
            YES => flags.insert(key.clone(), true),
            NO => flags.insert(key.clone(), false),
            // Any non-boolean token means the whole line is a server
            // error, e.g. `Filter does not exist`.
            _ => return Err(Error::Server(line.to_string())),
        };
    }
    Ok(Value::Flags(flags))
}

fn single_line(frame: &Frame) -> Result<&str, Error> {
    match frame {
        Frame::Line(line) => Ok(line),
        Frame::Block(lines) => Err(Error::UnexpectedResponse(format!(
            "expected a single line, got a {}-line block",
            lines.len()
        ))),
    }
}

fn block(frame: &Frame) -> Result<&[String], Error> {
    match frame {
        Frame::Block(lines) => Ok(lines),
        // A bare line where a block was expected is the server reporting
        // an error for the command.
        Frame::Line(line) => Err(Error::Server(line.clone())),
    }
}
