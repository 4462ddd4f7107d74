use thiserror::Error;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CliInvocation {
    PrintHelp,
    PrintVersion,
    Monitor {
        session_id: String,
        base_url: Option<String>,
        token: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum CliParseError {
    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("missing value for flag: {0}")]
    MissingFlagValue(String),

    #[error("missing session id")]
    MissingSessionId,

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}

pub fn parse_invocation(args: &[String]) -> Result<CliInvocation, CliParseError> {
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        return Ok(CliInvocation::PrintHelp);
    }
    if args.iter().any(|arg| arg == "--version" || arg == "-V") {
        return Ok(CliInvocation::PrintVersion);
    }

    let mut iter = args.iter().skip(1);
    let mut base_url: Option<String> = None;
    let mut token: Option<String> = None;
    let mut session_id: Option<String> = None;

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--base-url" => {
                let value = iter
                    .next()
                    .ok_or_else(|| CliParseError::MissingFlagValue(arg.clone()))?;
                base_url = Some(value.clone());
            }
            "--token" => {
                let value = iter
                    .next()
                    .ok_or_else(|| CliParseError::MissingFlagValue(arg.clone()))?;
                token = Some(value.clone());
            }
            value if value.starts_with('-') => {
                return Err(CliParseError::UnknownFlag(value.to_string()));
            }
            value => {
                if session_id.is_some() {
                    return Err(CliParseError::UnexpectedArgument(value.to_string()));
                }
                session_id = Some(value.to_string());
            }
        }
    }

    let session_id = session_id.ok_or(CliParseError::MissingSessionId)?;
    Ok(CliInvocation::Monitor {
        session_id,
        base_url,
        token,
    })
}
