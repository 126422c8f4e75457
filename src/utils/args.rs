//! Argument normalization utilities.
//!
//! Transforms CLI arguments before clap parsing so invocation overrides
//! (`--branch=prod`, `--fixtures`) can be mixed freely with known flags.

/// Auto-insert a `--` separator before the first unknown flag of commands
/// that accept `--key=value` overrides.
///
/// If `--` is already present, args pass through unchanged. Both styles work
/// identically:
///   rollout run deploy --on web1 --branch=prod
///   rollout run deploy --on web1 -- --branch=prod
pub fn normalize_trailing_flags(args: Vec<String>) -> Vec<String> {
    const GLOBAL_FLAGS: &[&str] = &["--recipe", "--verbose", "-v", "-vv", "--help", "-h"];
    let commands: &[(&str, &[&str])] = &[
        ("run", &["--on", "--parallel", "--all-or-nothing", "--deadline"]),
        ("plan", &["--on"]),
    ];

    let command = subcommand(&args);
    let known_flags = commands
        .iter()
        .find(|(cmd, _)| command == Some(*cmd))
        .map(|(_, flags)| *flags);

    let Some(known_flags) = known_flags else {
        return args;
    };
    if args.iter().any(|a| a == "--") {
        return args;
    }
    let is_known = |arg: &str| {
        known_flags
            .iter()
            .chain(GLOBAL_FLAGS)
            .any(|f| arg == *f || arg.starts_with(&format!("{}=", f)))
    };

    let mut result = Vec::with_capacity(args.len() + 1);
    let mut insert_position: Option<usize> = None;

    for (i, arg) in args.iter().enumerate() {
        if insert_position.is_none() && arg.starts_with("--") && !is_known(arg) {
            insert_position = Some(i);
        }
        result.push(arg.clone());
    }

    if let Some(pos) = insert_position {
        result.insert(pos, "--".to_string());
    }

    result
}

/// First positional argument after the binary name, skipping the value of
/// `--recipe`.
fn subcommand(args: &[String]) -> Option<&str> {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--recipe" {
            iter.next();
        } else if !arg.starts_with('-') {
            return Some(arg.as_str());
        }
    }
    None
}

/// Apply all argument normalizations in sequence.
pub fn normalize(args: Vec<String>) -> Vec<String> {
    normalize_trailing_flags(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn run_inserts_separator_before_overrides() {
        let result = normalize(args(&["rollout", "run", "deploy", "--on", "web1", "--branch=prod"]));
        assert_eq!(
            result,
            args(&["rollout", "run", "deploy", "--on", "web1", "--", "--branch=prod"])
        );
    }

    #[test]
    fn existing_separator_is_preserved() {
        let input = args(&["rollout", "run", "deploy", "--", "--branch=prod"]);
        assert_eq!(normalize(input.clone()), input);
    }

    #[test]
    fn known_flags_are_left_alone() {
        let input = args(&["rollout", "--recipe", "r.json", "run", "deploy", "--on=web1", "-v"]);
        assert_eq!(normalize(input.clone()), input);
    }

    #[test]
    fn recipe_value_is_not_taken_for_the_command() {
        let result = normalize(args(&["rollout", "--recipe", "r.json", "run", "deploy", "--fixtures"]));
        assert_eq!(result[5], "--");
        assert_eq!(result[6], "--fixtures");
    }

    #[test]
    fn other_commands_pass_through() {
        let input = args(&["rollout", "releases", "--on", "web1"]);
        assert_eq!(normalize(input.clone()), input);
    }
}
