// Generic traversal: every object kind enumerates the counted references it
// holds. Both collectors and the destructor go through these two functions,
// so a new kind only has to extend the matches below.

use crate::LuaValue;
use crate::gc::GcObjectData;
use crate::lua_value::{LUA_VTABLE, LUA_VTHREAD, LuaUpvalue};

impl GcObjectData {
    /// Call `f` once per counted outgoing reference
    pub fn for_each_ref(&self, mut f: impl FnMut(LuaValue)) {
        let mut visit = |v: LuaValue| {
            if v.is_collectable() {
                f(v)
            }
        };
        match self {
            GcObjectData::String(_)
            | GcObjectData::BoxedInt(_)
            | GcObjectData::BoxedFloat(_)
            | GcObjectData::Shell => {}
            GcObjectData::Table(t) => {
                for v in &t.array {
                    visit(*v);
                }
                for (k, v) in &t.hash {
                    visit(*k);
                    visit(*v);
                }
                if let Some(mt) = t.metatable {
                    visit(LuaValue::from_gc(LUA_VTABLE, mt));
                }
            }
            GcObjectData::Closure(c) => {
                visit(c.proto);
                for uv in &c.upvalues {
                    visit(*uv);
                }
            }
            GcObjectData::CClosure(c) => {
                for uv in &c.upvalues {
                    visit(*uv);
                }
            }
            GcObjectData::Proto(p) => {
                visit(p.source);
                for k in &p.constants {
                    visit(*k);
                }
                for child in &p.protos {
                    visit(*child);
                }
            }
            GcObjectData::Upvalue(uv) => match uv {
                LuaUpvalue::Open { thread, .. } => visit(LuaValue::from_gc(LUA_VTHREAD, *thread)),
                LuaUpvalue::Closed(v) => visit(*v),
            },
            GcObjectData::Userdata(u) => {
                visit(u.user_value);
                if let Some(mt) = u.metatable {
                    visit(LuaValue::from_gc(LUA_VTABLE, mt));
                }
            }
            GcObjectData::Thread(th) => {
                for v in &th.stack {
                    visit(*v);
                }
            }
        }
    }

    /// Ids of the counted outgoing references, appended to `out`
    pub fn collect_refs(&self, out: &mut Vec<crate::GcId>) {
        self.for_each_ref(|v| {
            if let Some(id) = v.gc_id() {
                out.push(id);
            }
        });
    }

    /// Strip the object of its outgoing references, leaving a shell.
    /// The caller owns the returned references and must release them.
    /// Open upvalues of a thread are not included; they must be closed first.
    pub fn take_refs(&mut self, out: &mut Vec<LuaValue>) {
        let data = std::mem::replace(self, GcObjectData::Shell);
        let mut push = |v: LuaValue| {
            if v.is_collectable() {
                out.push(v)
            }
        };
        match data {
            GcObjectData::String(_)
            | GcObjectData::BoxedInt(_)
            | GcObjectData::BoxedFloat(_)
            | GcObjectData::Shell => {}
            GcObjectData::Table(t) => {
                for v in t.array {
                    push(v);
                }
                for (k, v) in t.hash {
                    push(k);
                    push(v);
                }
                if let Some(mt) = t.metatable {
                    push(LuaValue::from_gc(LUA_VTABLE, mt));
                }
            }
            GcObjectData::Closure(c) => {
                push(c.proto);
                for uv in c.upvalues {
                    push(uv);
                }
            }
            GcObjectData::CClosure(c) => {
                for uv in c.upvalues {
                    push(uv);
                }
            }
            GcObjectData::Proto(p) => {
                push(p.source);
                for k in p.constants {
                    push(k);
                }
                for child in p.protos {
                    push(child);
                }
            }
            GcObjectData::Upvalue(uv) => match uv {
                LuaUpvalue::Open { thread, .. } => push(LuaValue::from_gc(LUA_VTHREAD, thread)),
                LuaUpvalue::Closed(v) => push(v),
            },
            GcObjectData::Userdata(u) => {
                push(u.user_value);
                if let Some(mt) = u.metatable {
                    push(LuaValue::from_gc(LUA_VTABLE, mt));
                }
            }
            GcObjectData::Thread(th) => {
                for v in th.stack {
                    push(v);
                }
            }
        }
    }
}
