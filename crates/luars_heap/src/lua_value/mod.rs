mod lua_function;
mod lua_string;
mod lua_table;
mod lua_thread;
mod lua_userdata;
#[allow(clippy::module_inception)]
mod lua_value;

pub use lua_function::{CClosure, LuaClosure, LuaProto, LuaUpvalue};
pub use lua_string::{InternLink, LuaString};
pub use lua_table::{Displaced, LuaTable};
pub use lua_thread::LuaThread;
pub use lua_userdata::LuaUserdata;
pub use lua_value::*;
