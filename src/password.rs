use std::io::{self, BufRead, Write};

/// Prompt for a password. Piped stdin (e.g. from a wrapper script) falls
/// back to a plain line read instead of the hidden terminal prompt.
pub fn read_password(prompt: &str) -> io::Result<String> {
    if atty::is(atty::Stream::Stdin) {
        return rpassword::prompt_password(prompt);
    }

    print!("{prompt}");
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
