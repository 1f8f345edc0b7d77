//! Localized help output for the CLI.
//!
//! Clap stays the single source of truth for structure; every user-visible
//! string (headings, command descriptions, argument help) is replaced with
//! its translation when the current locale has one.

use clap::CommandFactory;
use rust_i18n::t;

use crate::Cli;

/// Supported locales for i18n.
pub(crate) const SUPPORTED_LOCALES: &[&str] = &["en", "zh-CN"];

/// Map a system locale string onto a supported locale.
///
/// `zh_CN.UTF-8`, `zh-TW` and `zh` become `zh-CN`; everything else,
/// including `C` and `POSIX`, becomes `en`.
pub(crate) fn normalize_locale(raw: &str) -> &'static str {
    let base = raw.split(['.', '@']).next().unwrap_or(raw).replace('_', "-");
    if let Some(exact) = SUPPORTED_LOCALES.iter().find(|l| l.eq_ignore_ascii_case(&base)) {
        return *exact;
    }
    let lang = base.split('-').next().unwrap_or_default();
    if lang.eq_ignore_ascii_case("zh") {
        "zh-CN"
    } else {
        "en"
    }
}

/// Best supported locale for the current system.
pub(crate) fn detect_locale() -> String {
    sys_locale::get_locale()
        .map_or("en", |l| normalize_locale(&l))
        .to_string()
}

/// Translation of `key`, if the locale files define it.
fn lookup(key: &str) -> Option<String> {
    let text = t!(key).to_string();
    (text != key).then_some(text)
}

fn leak(text: String) -> &'static str {
    // Headings must be 'static; the process prints help once and exits.
    Box::leak(text.into_boxed_str())
}

/// Replace an arg's help text and put it under the matching heading.
fn localize_arg(arg: clap::Arg, args_heading: &'static str, opts_heading: &'static str) -> clap::Arg {
    let positional = arg.get_short().is_none() && arg.get_long().is_none();
    let arg = match lookup(&format!("arg.{}.help", arg.get_id().as_str())) {
        Some(help) => arg.help(help),
        None => arg,
    };
    arg.help_heading(if positional { args_heading } else { opts_heading })
}

/// Build a clap `Command` with fully localized help output.
pub(crate) fn build_localized_command() -> clap::Command {
    let args_heading = leak(t!("help.arguments_heading").to_string());
    let opts_heading = leak(t!("help.options_heading").to_string());
    let usage_heading = t!("help.usage_heading");

    let top_template = format!(
        "{{bin}} {{version}}\n\n{{about}}\n\n{usage_heading}:\n  {{usage}}\n\n\
         {commands}:\n{{subcommands}}\n\n{opts_heading}:\n{{options}}\n\n{{after-help}}\n",
        commands = t!("help.commands_heading"),
    );
    let sub_template =
        format!("{{bin}} {{version}}\n\n{{about}}\n\n{usage_heading}:\n  {{usage}}\n\n{{all-args}}\n");

    Cli::command()
        .help_template(top_template)
        .about(t!("app.about").to_string())
        .after_help(t!("app.after_help").to_string())
        .disable_help_flag(true)
        .disable_version_flag(true)
        .disable_help_subcommand(true)
        .arg(
            clap::Arg::new("help")
                .short('h')
                .long("help")
                .help(t!("arg.help_flag.help").to_string())
                .action(clap::ArgAction::Help)
                .global(true),
        )
        .arg(
            clap::Arg::new("version")
                .short('V')
                .long("version")
                .help(t!("arg.version_flag.help").to_string())
                .action(clap::ArgAction::Version)
                .global(true),
        )
        .mut_args(move |arg| localize_arg(arg, args_heading, opts_heading))
        .mut_subcommands(move |sub| {
            let key = format!("cmd.{}.about", sub.get_name().replace('-', "_"));
            let sub = match lookup(&key) {
                Some(about) => sub.about(about),
                None => sub,
            };
            sub.help_template(sub_template.clone())
                .mut_args(move |arg| localize_arg(arg, args_heading, opts_heading))
        })
        .subcommand(clap::Command::new("help").about(t!("cmd.help.about").to_string()))
}

/// Print localized help for `args` and return the exit code.
pub(crate) fn print_localized_help(args: &[String]) -> i32 {
    let mut cmd = build_localized_command();
    if args.len() <= 1 {
        return match cmd.print_help() {
            Ok(()) => 0,
            Err(_) => 1,
        };
    }
    match cmd.try_get_matches_from(args) {
        Ok(_) => 0,
        Err(e) => {
            let code = e.exit_code();
            if e.print().is_err() {
                return 1;
            }
            code
        },
    }
}

#[cfg(test)]
mod locale_tests {
    use super::*;

    #[test]
    fn test_normalize_locale() {
        assert_eq!(normalize_locale("zh_CN.UTF-8"), "zh-CN");
        assert_eq!(normalize_locale("zh-CN"), "zh-CN");
        assert_eq!(normalize_locale("zh"), "zh-CN");
        assert_eq!(normalize_locale("zh_TW"), "zh-CN");
        assert_eq!(normalize_locale("en_US.UTF-8"), "en");
        assert_eq!(normalize_locale("de_DE@euro"), "en");
        assert_eq!(normalize_locale("C"), "en");
        assert_eq!(normalize_locale("POSIX"), "en");
        assert_eq!(normalize_locale(""), "en");
    }

    #[test]
    fn test_detect_locale_is_supported() {
        assert!(SUPPORTED_LOCALES.contains(&detect_locale().as_str()));
    }

    #[test]
    fn test_localized_command_builds() {
        rust_i18n::set_locale("en");
        let cmd = build_localized_command();
        assert!(cmd.find_subcommand("update").is_some());
        assert!(cmd.find_subcommand("help").is_some());
    }

    #[test]
    fn test_lookup_missing_key() {
        assert!(lookup("definitely.not.a.key").is_none());
        rust_i18n::set_locale("en");
        assert!(lookup("app.about").is_some());
    }
}
