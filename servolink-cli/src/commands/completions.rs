//! Shell completion generation and installation.

use {
    crate::{Cli, CliError},
    anyhow::{Context, Result},
    clap::CommandFactory,
    clap_complete::{Shell, generate},
    console::style,
    directories::BaseDirs,
    rust_i18n::t,
    std::{
        env, fs,
        io::{self, Write},
        path::{Path, PathBuf},
    },
};

const BIN: &str = "servolink";

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    write_completions(shell, &mut io::stdout());
}

fn write_completions(shell: Shell, out: &mut dyn Write) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN, out);
}

/// Guess the running shell from `$SHELL`, or PowerShell on Windows.
fn detect_shell() -> Option<Shell> {
    if let Ok(path) = env::var("SHELL") {
        return shell_from_path(&path);
    }
    (cfg!(windows) && env::var_os("PSModulePath").is_some()).then_some(Shell::PowerShell)
}

fn shell_from_path(path: &str) -> Option<Shell> {
    match Path::new(path).file_stem()?.to_str()? {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Where the completion script for `shell` goes, relative to the user dirs.
fn install_path(shell: Shell, dirs: &BaseDirs) -> Option<PathBuf> {
    let path = match shell {
        Shell::Bash => dirs
            .data_dir()
            .join("bash-completion/completions")
            .join(BIN),
        Shell::Zsh => dirs.home_dir().join(".zfunc").join(format!("_{BIN}")),
        Shell::Fish => dirs
            .config_dir()
            .join("fish/completions")
            .join(format!("{BIN}.fish")),
        Shell::Elvish => dirs
            .config_dir()
            .join("elvish/lib")
            .join(format!("{BIN}.elv")),
        Shell::PowerShell => dirs
            .config_dir()
            .join("powershell/completions")
            .join(format!("{BIN}.ps1")),
        _ => return None,
    };
    Some(path)
}

fn install_to(shell: Shell, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut script = Vec::new();
    write_completions(shell, &mut script);
    fs::write(path, script).with_context(|| format!("Failed to write {}", path.display()))
}

/// Shell-specific line the user still has to add, if any.
fn activation_hint(shell: Shell, path: &Path) -> Option<String> {
    match shell {
        Shell::Zsh => Some("fpath=(~/.zfunc $fpath); autoload -Uz compinit && compinit".into()),
        Shell::Elvish => Some(format!("use {BIN}")),
        Shell::PowerShell => Some(format!(". \"{}\"", path.display())),
        _ => None,
    }
}

/// Write the completion script for the current (or given) shell.
pub(crate) fn cmd_completions_install(shell: Option<Shell>) -> Result<()> {
    let shell = shell
        .or_else(detect_shell)
        .ok_or_else(|| CliError::Usage(t!("completions.unknown_shell").to_string()))?;
    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = install_path(shell, &dirs)
        .ok_or_else(|| CliError::Usage(t!("completions.unsupported", shell = shell).to_string()))?;

    install_to(shell, &path)?;

    eprintln!(
        "{} {}",
        style("✓").green(),
        t!("completions.installed", shell = shell, path = path.display())
    );
    if let Some(hint) = activation_hint(shell, &path) {
        eprintln!("  {}", t!("completions.activate_hint"));
        eprintln!("    {}", style(hint).cyan());
    }
    eprintln!("  {}", style(t!("completions.restart_hint")).dim());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_from_path() {
        assert_eq!(shell_from_path("/bin/bash"), Some(Shell::Bash));
        assert_eq!(shell_from_path("/usr/local/bin/zsh"), Some(Shell::Zsh));
        assert_eq!(shell_from_path("/usr/bin/fish"), Some(Shell::Fish));
        assert_eq!(shell_from_path("pwsh.exe"), Some(Shell::PowerShell));
        assert_eq!(shell_from_path("/bin/tcsh"), None);
        assert_eq!(shell_from_path(""), None);
    }

    #[test]
    fn test_install_paths_name_the_binary() {
        let Some(dirs) = BaseDirs::new() else {
            return;
        };
        for shell in [
            Shell::Bash,
            Shell::Zsh,
            Shell::Fish,
            Shell::Elvish,
            Shell::PowerShell,
        ] {
            let path = install_path(shell, &dirs).unwrap();
            assert!(path.to_string_lossy().contains(BIN), "{shell}: {path:?}");
        }
        assert!(
            install_path(Shell::Zsh, &dirs)
                .unwrap()
                .ends_with(".zfunc/_servolink")
        );
    }

    #[test]
    fn test_install_writes_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/servolink.fish");
        install_to(Shell::Fish, &path).unwrap();
        let script = fs::read_to_string(&path).unwrap();
        assert!(script.contains("servolink"));
        assert!(script.contains("cycle"));
    }

    #[test]
    fn test_generated_bash_mentions_subcommands() {
        let mut out = Vec::new();
        write_completions(Shell::Bash, &mut out);
        let script = String::from_utf8(out).unwrap();
        for sub in ["list-ports", "update", "terminal"] {
            assert!(script.contains(sub), "missing {sub}");
        }
    }

    #[test]
    fn test_activation_hints() {
        let path = Path::new("/tmp/x");
        assert!(activation_hint(Shell::Bash, path).is_none());
        assert!(activation_hint(Shell::Zsh, path).unwrap().contains("compinit"));
    }
}
