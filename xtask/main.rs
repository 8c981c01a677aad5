use std::io;

use clap::{
  CommandFactory,
  Parser as _,
};

#[derive(clap::Parser)]
struct Cli {
  #[clap(subcommand)]
  command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
  /// Generate cputhrottle completions for the specified shell.
  GenerateCompletions {
    #[arg(long)]
    shell: Shell,
  },

  /// Print the builtin daemon config, to use as a starting point.
  DefaultConfig,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Shell {
  Bash,
  Elvish,
  Fish,
  #[value(name = "powershell")]
  PowerShell,
  Zsh,
  Nushell,
}

impl Shell {
  fn generator(self) -> &'static dyn clap_complete::Generator {
    match self {
      Self::Bash => &clap_complete::Shell::Bash,
      Self::Elvish => &clap_complete::Shell::Elvish,
      Self::Fish => &clap_complete::Shell::Fish,
      Self::PowerShell => &clap_complete::Shell::PowerShell,
      Self::Zsh => &clap_complete::Shell::Zsh,
      Self::Nushell => &clap_complete_nushell::Nushell,
    }
  }
}

fn main() {
  match Cli::parse().command {
    Command::GenerateCompletions { shell } => {
      let mut command = cputhrottle::Cli::command();
      command.set_bin_name("cputhrottle");
      command.build();

      shell.generator().generate(&command, &mut io::stdout());
    },

    Command::DefaultConfig => {
      print!("{}", cputhrottle::config::DaemonConfig::DEFAULT);
    },
  }
}
