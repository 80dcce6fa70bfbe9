use super::EXIT_SUCCESS;
use clap::CommandFactory;
use clap_complete::Shell;

/// Completion script for the binary name clap was configured with.
#[allow(clippy::unnecessary_wraps)]
pub fn run<C: CommandFactory>(shell: Shell) -> Result<u8, String> {
    let mut command = C::command();
    let bin_name = command.get_name().to_owned();
    clap_complete::generate(shell, &mut command, bin_name, &mut std::io::stdout().lock());
    Ok(EXIT_SUCCESS)
}
