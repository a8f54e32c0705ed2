//! Request throttling and page inspection for scrapers.

pub mod anti_ban;
pub mod page_inspector;
