use super::{execute, report_error, Target};
use dialoguer::Select;
use std::io::{stderr, stdin, BufRead, IsTerminal, Write};
use toolrig_core::{CoreError, DesignMode, Goal};
use toolrig_workspace::validate_design_id;

const MODE_CHOICES: &[&str] = &["1  full flow (non-interactive)", "2  interactive session"];

pub fn run(target: &Target, id: &str, mode: Option<&str>, json_output: bool) -> Result<u8, String> {
    // Reject a bad identifier before asking anything.
    if let Err(e) = validate_design_id(id) {
        return Ok(report_error(&CoreError::from(e).into()));
    }
    let goal = match mode
        .map_or_else(prompt_mode, DesignMode::parse)
        .and_then(|mode| Goal::design(id, mode))
    {
        Ok(goal) => goal,
        Err(e) => return Ok(report_error(&e.into())),
    };
    execute(target, &goal, json_output)
}

fn prompt_mode() -> Result<DesignMode, CoreError> {
    if stdin().is_terminal() && stderr().is_terminal() {
        let choice = Select::new()
            .with_prompt("How should the design run?")
            .items(MODE_CHOICES)
            .default(0)
            .interact()
            .map_err(|e| CoreError::Io(std::io::Error::other(e)))?;
        return Ok(mode_for_choice(choice));
    }

    eprint!("mode [1 = full flow, 2 = interactive]: ");
    stderr().flush()?;
    read_mode(&mut stdin().lock())
}

fn mode_for_choice(index: usize) -> DesignMode {
    if index == 0 {
        DesignMode::Batch
    } else {
        DesignMode::Interactive
    }
}

/// One line from `input`; end of input is an invalid answer.
fn read_mode(input: &mut impl BufRead) -> Result<DesignMode, CoreError> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    DesignMode::parse(&line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piped_answers_select_the_mode() {
        assert_eq!(read_mode(&mut "1\n".as_bytes()).unwrap(), DesignMode::Batch);
        assert_eq!(
            read_mode(&mut "2\n".as_bytes()).unwrap(),
            DesignMode::Interactive
        );
    }

    #[test]
    fn empty_or_unknown_answer_is_invalid() {
        assert!(matches!(
            read_mode(&mut "".as_bytes()),
            Err(CoreError::InvalidMode(_))
        ));
        assert!(matches!(
            read_mode(&mut "3\n".as_bytes()),
            Err(CoreError::InvalidMode(_))
        ));
    }

    #[test]
    fn select_rows_map_to_modes() {
        assert_eq!(mode_for_choice(0), DesignMode::Batch);
        assert_eq!(mode_for_choice(1), DesignMode::Interactive);
        assert_eq!(MODE_CHOICES.len(), 2);
    }
}
