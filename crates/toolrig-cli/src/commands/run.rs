use super::{execute, Target};
use toolrig_core::Goal;

pub fn run(target: &Target, json_output: bool) -> Result<u8, String> {
    execute(target, &Goal::SelfTest, json_output)
}
