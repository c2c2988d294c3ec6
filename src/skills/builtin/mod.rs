pub mod execute_code;

pub use execute_code::ExecuteCodeSkill;
