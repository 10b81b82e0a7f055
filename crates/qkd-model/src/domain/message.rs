use std::{fmt, str::FromStr};

use crate::ModelError;

/// Detection rate in counts per second as exchanged during negotiation.
pub type Rate = u64;

/// A message exchanged with the partner node over the messaging channel.
///
/// The wire form is a single newline-terminated text line (`ne1:1000`, `st2`, ...).
/// Lines are parsed into this enum at the boundary; nothing deeper in the system splits strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `ne1:<rate>`: opens a negotiation with the sender's rate.
    Ne1 { rate: Rate },
    /// `ne2:<rate>:<echo>`: reply with own rate and an echo of the peer's rate.
    Ne2 { rate: Rate, echo: Rate },
    /// `ne3:<rate>:<echo>`: confirmation with own rate and the peer's rate.
    Ne3 { rate: Rate, echo: Rate },
    St1,
    St2,
    St3,
    StopKeyGen,
    StartServiceMode,
    StartServiceModeStep2,
    /// Anything else; forwarded verbatim.
    Other(String),
}

impl Message {
    /// Returns `true` for the `ne*` symmetry-negotiation messages.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Message::Ne1 { .. } | Message::Ne2 { .. } | Message::Ne3 { .. }
        )
    }

    /// Short tag used in logs.
    pub fn tag(&self) -> &str {
        match self {
            Message::Ne1 { .. } => "ne1",
            Message::Ne2 { .. } => "ne2",
            Message::Ne3 { .. } => "ne3",
            Message::St1 => "st1",
            Message::St2 => "st2",
            Message::St3 => "st3",
            Message::StopKeyGen => "stop_key_gen",
            Message::StartServiceMode => "start_service_mode",
            Message::StartServiceModeStep2 => "start_service_mode_step2",
            Message::Other(_) => "other",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Ne1 { rate } => write!(f, "ne1:{rate}"),
            Message::Ne2 { rate, echo } => write!(f, "ne2:{rate}:{echo}"),
            Message::Ne3 { rate, echo } => write!(f, "ne3:{rate}:{echo}"),
            Message::Other(raw) => f.write_str(raw),
            other => f.write_str(other.tag()),
        }
    }
}

impl FromStr for Message {
    type Err = ModelError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ModelError::UnknownMessage(String::new()));
        }

        let mut parts = line.split(':');
        let head = parts.next().unwrap_or_default();
        let fields: Vec<&str> = parts.collect();

        let msg = match head {
            "ne1" => {
                let [rate] = rates::<1>(line, &fields)?;
                Message::Ne1 { rate }
            }
            "ne2" => {
                let [rate, echo] = rates::<2>(line, &fields)?;
                Message::Ne2 { rate, echo }
            }
            "ne3" => {
                let [rate, echo] = rates::<2>(line, &fields)?;
                Message::Ne3 { rate, echo }
            }
            "st1" => Message::St1,
            "st2" => Message::St2,
            "st3" => Message::St3,
            "stop_key_gen" => Message::StopKeyGen,
            "start_service_mode" => Message::StartServiceMode,
            "start_service_mode_step2" => Message::StartServiceModeStep2,
            _ => Message::Other(line.to_string()),
        };
        Ok(msg)
    }
}

fn rates<const N: usize>(line: &str, fields: &[&str]) -> Result<[Rate; N], ModelError> {
    if fields.len() != N {
        return Err(ModelError::MalformedMessage {
            line: line.to_string(),
            reason: format!("expected {N} rate field(s), got {}", fields.len()),
        });
    }
    let mut out = [0; N];
    for (slot, raw) in out.iter_mut().zip(fields) {
        *slot = raw
            .trim()
            .parse::<Rate>()
            .map_err(|e| ModelError::MalformedMessage {
                line: line.to_string(),
                reason: format!("bad rate '{raw}': {e}"),
            })?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_negotiation_messages() {
        assert_eq!("ne1:1000".parse::<Message>().unwrap(), Message::Ne1 { rate: 1000 });
        assert_eq!(
            "ne2:2000:1000\n".parse::<Message>().unwrap(),
            Message::Ne2 { rate: 2000, echo: 1000 }
        );
        assert_eq!(
            "ne3:1000:2000".parse::<Message>().unwrap(),
            Message::Ne3 { rate: 1000, echo: 2000 }
        );
    }

    #[test]
    fn parses_sequencing_messages() {
        let cases = [
            ("st1", Message::St1),
            ("st2", Message::St2),
            ("st3", Message::St3),
            ("stop_key_gen", Message::StopKeyGen),
            ("start_service_mode", Message::StartServiceMode),
            ("start_service_mode_step2", Message::StartServiceModeStep2),
        ];
        for (wire, expected) in cases {
            let parsed: Message = wire.parse().unwrap();
            assert_eq!(parsed, expected, "parse {wire}");
            assert_eq!(parsed.to_string(), wire, "display {wire}");
        }
    }

    #[test]
    fn unknown_lines_are_kept_verbatim() {
        let msg: Message = "pol_comp:0.031".parse().unwrap();
        assert_eq!(msg, Message::Other("pol_comp:0.031".into()));
        assert_eq!(msg.to_string(), "pol_comp:0.031");
        assert!(!msg.is_negotiation());
    }

    #[test]
    fn malformed_negotiation_is_rejected() {
        assert!(matches!(
            "ne1".parse::<Message>(),
            Err(ModelError::MalformedMessage { .. })
        ));
        assert!(matches!(
            "ne2:12".parse::<Message>(),
            Err(ModelError::MalformedMessage { .. })
        ));
        assert!(matches!(
            "ne3:a:b".parse::<Message>(),
            Err(ModelError::MalformedMessage { .. })
        ));
        assert!("".parse::<Message>().is_err());
    }

    #[test]
    fn display_matches_wire_format() {
        assert_eq!(Message::Ne2 { rate: 5, echo: 7 }.to_string(), "ne2:5:7");
        assert!(Message::Ne3 { rate: 1, echo: 2 }.is_negotiation());
    }
}
