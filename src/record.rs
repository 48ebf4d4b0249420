use crate::error::ProbeError;
use chrono::{DateTime, Local, TimeZone};
use std::fmt;

pub const DELIMITER: char = ';';
pub const HEADER: [&str; 4] = ["Timestamp", "Speed_MB/s", "Status", "ERROR"];
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Speed written for attempts that could not be measured.
pub const FAILURE_SPEED: f64 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "BAD REQUEST",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(Status::Ok),
            "BAD REQUEST" => Some(Status::BadRequest),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One measurement attempt as written to the results log.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Local wall-clock time, `YYYY-MM-DD HH:MM:SS`
    pub timestamp: String,
    pub speed: f64,
    pub status: Status,
    pub error: Option<String>,
}

impl Record {
    pub fn success<Tz: TimeZone>(at: &DateTime<Tz>, speed: f64) -> Self
    where
        Tz::Offset: fmt::Display,
    {
        Self {
            timestamp: format_timestamp(at),
            speed,
            status: Status::Ok,
            error: None,
        }
    }

    pub fn failure<Tz: TimeZone>(at: &DateTime<Tz>, reason: &ProbeError) -> Self
    where
        Tz::Offset: fmt::Display,
    {
        Self {
            timestamp: format_timestamp(at),
            speed: FAILURE_SPEED,
            status: Status::BadRequest,
            error: Some(reason.to_string()),
        }
    }

    pub fn from_outcome(outcome: &Result<f64, ProbeError>) -> Self {
        let at = Local::now();
        match outcome {
            Ok(speed) => Record::success(&at, *speed),
            Err(reason) => Record::failure(&at, reason),
        }
    }

    /// Serializes the record as one delimited row, without the line terminator.
    pub fn to_row(&self) -> String {
        let error = self.error.as_deref().map(sanitize).unwrap_or_default();
        format!(
            "{ts}{d}{speed}{d}{status}{d}{error}",
            ts = sanitize(&self.timestamp),
            speed = self.speed,
            status = self.status,
            d = DELIMITER,
        )
    }

    pub fn from_row(row: &str) -> Result<Self, String> {
        let fields: Vec<&str> = row.split(DELIMITER).collect();
        if fields.len() != HEADER.len() {
            return Err(format!(
                "expected {} columns, found {}",
                HEADER.len(),
                fields.len()
            ));
        }

        let speed = fields[1]
            .parse::<f64>()
            .map_err(|e| format!("invalid speed {:?}: {}", fields[1], e))?;
        let status =
            Status::parse(fields[2]).ok_or_else(|| format!("unknown status {:?}", fields[2]))?;
        let error = if fields[3].is_empty() {
            None
        } else {
            Some(fields[3].to_string())
        };

        Ok(Self {
            timestamp: fields[0].to_string(),
            speed,
            status,
            error,
        })
    }
}

pub fn header_row() -> String {
    HEADER.join(DELIMITER.to_string().as_str())
}

pub fn format_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Keeps a field on one line and free of the column delimiter.
fn sanitize(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            DELIMITER => ',',
            '\r' | '\n' => ' ',
            other => other,
        })
        .collect()
}
