pub mod issue;
pub mod outcome;
pub mod tag;
pub mod time_record;
pub mod worklog;
