mod create;
mod run;
mod scan;

pub use create::cmd_create;
pub use run::{cmd_run, print_summary};
pub use scan::cmd_scan;
