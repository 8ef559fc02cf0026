use iptunnel_traits::process::ProcessError;

/// Splits a command line into words the way a POSIX shell would for simple
/// commands: whitespace separates words, single and double quotes group, and
/// a backslash escapes the next character outside single quotes.
pub fn split_command_line(input: &str) -> Result<Vec<String>, ProcessError> {
    let mut words = Vec::new();
    let mut current = String::new();
    // Tracks `''` and `""`, which still produce an (empty) word.
    let mut quoted = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' if !in_single => match chars.next() {
                Some(next) => current.push(next),
                None => return Err(ProcessError::Parse("trailing backslash".to_string())),
            },
            '\'' if !in_double => {
                in_single = !in_single;
                quoted = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                quoted = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() || quoted {
                    words.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            _ => current.push(ch),
        }
    }

    if in_single || in_double {
        return Err(ProcessError::Parse("unclosed quote".to_string()));
    }
    if !current.is_empty() || quoted {
        words.push(current);
    }

    Ok(words)
}
