pub mod args;
pub mod io;
pub mod shell;
pub mod template;
