use std::{
  borrow::Cow,
  io::{
    self,
    Write as _,
  },
  process::ExitCode,
};

use yansi::Paint as _;

fn main() -> ExitCode {
  match cputhrottle::main() {
    Ok(code) => code,

    Err(error) => {
      report(&error);
      ExitCode::FAILURE
    },
  }
}

/// Print the error chain, root cause first.
fn report(error: &anyhow::Error) {
  let mut err = io::stderr().lock();

  let mut chain = error.chain().rev().peekable();

  while let Some(cause) = chain.next() {
    let header = if chain.peek().is_none() {
      "error:"
    } else {
      "cause:"
    };

    let _ = writeln!(
      err,
      "{header} {message}",
      header = header.red().bold(),
      message = lowercase_first(&cause.to_string()),
    );
  }
}

/// Lowercase the first letter unless it starts an acronym, like `CPU`.
fn lowercase_first(message: &str) -> Cow<'_, str> {
  let mut chars = message.chars();

  match (chars.next(), chars.next()) {
    (Some(first), Some(second))
      if first.is_uppercase() && second.is_lowercase() =>
    {
      let rest = &message[first.len_utf8()..];

      Cow::Owned(first.to_lowercase().chain(rest.chars()).collect())
    },

    _ => Cow::Borrowed(message),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn only_words_are_lowercased() {
    assert_eq!(lowercase_first("Failed to read"), "failed to read");
    assert_eq!(lowercase_first("CPU is too hot"), "CPU is too hot");
    assert_eq!(lowercase_first("already lowercase"), "already lowercase");
    assert_eq!(lowercase_first("X"), "X");
    assert_eq!(lowercase_first(""), "");
  }
}
