pub mod html;
pub mod json_file;
pub mod time_meta;
