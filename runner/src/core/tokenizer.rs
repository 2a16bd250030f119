//! Quote-aware splitting of gate command strings into argument vectors.
//!
//! Supported syntax: whitespace-separated words, `'single'` and `"double"`
//! quoted segments (quotes stripped, contents taken literally) and `\x`
//! escapes outside quotes. Pipes, redirects, subshells and expansions are not
//! interpreted; gates that need them should call a script.

use thiserror::Error;

/// Command string could not be split into arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenizeError {
    #[error("unterminated {quote} quote in command: {command}")]
    UnterminatedQuote { quote: char, command: String },
    #[error("trailing backslash in command: {command}")]
    TrailingBackslash { command: String },
}

/// Split `command` into argument tokens.
pub fn tokenize(command: &str) -> Result<Vec<String>, TokenizeError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    // Tracks `''` so an empty quoted argument still produces a token.
    let mut in_token = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some(next) if next == c => break,
                        Some(next) => current.push(next),
                        None => {
                            return Err(TokenizeError::UnterminatedQuote {
                                quote: c,
                                command: command.to_string(),
                            });
                        }
                    }
                }
            }
            '\\' => match chars.next() {
                Some(escaped) => {
                    in_token = true;
                    current.push(escaped);
                }
                None => {
                    return Err(TokenizeError::TrailingBackslash {
                        command: command.to_string(),
                    });
                }
            },
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}
