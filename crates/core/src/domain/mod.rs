pub mod contact;
pub mod document;
pub mod draft;
