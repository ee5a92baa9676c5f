mod awaiter;
pub use self::awaiter::{ChildGroup, JobFn, Join, ResumeOn, YieldValue, job, join, resume_on, yield_value};

mod coro;
pub use self::coro::Coro;

pub(crate) mod header;
pub(crate) use self::header::Header;

pub(crate) mod plain;

pub(crate) mod promise;
