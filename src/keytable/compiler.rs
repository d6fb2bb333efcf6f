/* Key-table compiler: turns a line-based `.ktb` text file into a `KeyTable`.
 *
 * Grammar:
 *   # comment
 *   context <default|menu|editing|chords|waiting>
 *   bind <key>[+<key>...] <command>[|<flag>...] [hidden] [long_press]
 *   include <path>
 *
 * Key names are resolved against the driver's `KeyNameTable`; unresolved
 * names are a fatal compile error. */
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::command::{Block, Command, FLG_LONG_PRESS, FLG_MOTION_TOLEFT, FLG_TOGGLE_OFF, FLG_TOGGLE_ON};

use super::{
    BindingFlags, Combination, Context, ImmediateMatch, KeyBinding, KeyId, KeyNameTable, KeyTable,
    KeyTableError,
};

struct ParsedBind {
    keys: Vec<&'static str>,
    key_ids: Vec<KeyId>,
    block: Block,
    flags: u32,
    arg: u8,
    hidden: bool,
    long_press: bool,
}

/* Compile `path` (and any files it `include`s) into a `KeyTable`, resolving
 * key names against `names`. */
pub fn compile(path: &Path, names: KeyNameTable) -> Result<KeyTable, KeyTableError> {
    let mut bindings: HashMap<Context, Vec<KeyBinding>> = HashMap::new();
    let mut context = Context::Default;
    compile_file(path, names, &mut bindings, &mut context)?;
    synthesize_routing_long_press(&mut bindings);
    Ok(KeyTable { bindings })
}

fn compile_file(
    path: &Path,
    names: KeyNameTable,
    bindings: &mut HashMap<Context, Vec<KeyBinding>>,
    context: &mut Context,
) -> Result<(), KeyTableError> {
    let text = std::fs::read_to_string(path).map_err(|source| KeyTableError::Io {
        path: path.display().to_string(),
        source,
    })?;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let mut words = line.split_whitespace();
        let directive = words.next().unwrap();
        let rest: Vec<&str> = words.collect();

        let err = |message: String| KeyTableError::Syntax {
            path: path.display().to_string(),
            line: lineno + 1,
            message,
        };

        match directive {
            "context" => {
                *context = parse_context(&rest, &err)?;
            }
            "include" => {
                let Some(sub) = rest.first() else {
                    return Err(err("include requires a path".into()));
                };
                let sub_path = resolve_include(path, sub);
                compile_file(&sub_path, names, bindings, context)?;
            }
            "bind" => {
                let parsed = parse_bind(&rest, names, &err)?;
                let binding = build_binding(parsed);
                bindings.entry(*context).or_default().push(binding);
            }
            other => return Err(err(format!("unknown directive {other:?}"))),
        }
    }

    Ok(())
}

fn resolve_include(current: &Path, include: &str) -> PathBuf {
    let include_path = Path::new(include);
    if include_path.is_absolute() {
        include_path.to_path_buf()
    } else {
        current
            .parent()
            .map(|dir| dir.join(include_path))
            .unwrap_or_else(|| include_path.to_path_buf())
    }
}

fn parse_context(
    rest: &[&str],
    err: &dyn Fn(String) -> KeyTableError,
) -> Result<Context, KeyTableError> {
    let name = rest.first().ok_or_else(|| err("context requires a name".into()))?;
    Ok(match *name {
        "default" => Context::Default,
        "menu" => Context::Menu,
        "editing" => Context::Editing,
        "chords" => Context::Chords,
        "waiting" => Context::Waiting,
        other => return Err(err(format!("unknown context {other:?}"))),
    })
}

fn parse_bind(
    rest: &[&str],
    names: KeyNameTable,
    err: &dyn Fn(String) -> KeyTableError,
) -> Result<ParsedBind, KeyTableError> {
    let keys_field = rest.first().ok_or_else(|| err("bind requires keys".into()))?;
    let command_field = rest.get(1).ok_or_else(|| err("bind requires a command".into()))?;

    let mut keys = Vec::new();
    let mut key_ids = Vec::new();
    for key_name in keys_field.split('+') {
        let key = super::find_key_name(names, key_name)
            .ok_or_else(|| KeyTableError::UnknownKey(key_name.to_string()))?;
        keys.push(
            super::find_key_number(names, key.group, key.number)
                .expect("resolved key must exist in its own table"),
        );
        key_ids.push(key);
    }

    let (block, arg) = parse_command(command_field, err)?;

    let mut flags = 0u32;
    let mut hidden = false;
    let mut long_press = false;
    for modifier in &rest[2..] {
        match *modifier {
            "hidden" => hidden = true,
            "long_press" => long_press = true,
            "toggle_on" => flags |= FLG_TOGGLE_ON,
            "toggle_off" => flags |= FLG_TOGGLE_OFF,
            "motion_to_left" => flags |= FLG_MOTION_TOLEFT,
            other => return Err(err(format!("unknown bind modifier {other:?}"))),
        }
    }
    if long_press {
        flags |= FLG_LONG_PRESS;
    }

    Ok(ParsedBind {
        keys,
        key_ids,
        block,
        flags,
        arg,
        hidden,
        long_press,
    })
}

fn parse_command(
    field: &str,
    err: &dyn Fn(String) -> KeyTableError,
) -> Result<(Block, u8), KeyTableError> {
    let mut parts = field.splitn(2, ':');
    let name = parts.next().unwrap();
    let arg: u8 = match parts.next() {
        Some(n) => n
            .parse()
            .map_err(|_| err(format!("bad command argument {n:?}")))?,
        None => 0,
    };
    let block = match name {
        "LNUP" => Block::LnUp,
        "LNDN" => Block::LnDn,
        "PRDIFLN" => Block::PrDifLn,
        "NXDIFLN" => Block::NxDifLn,
        "FWINLT" => Block::FWinLt,
        "FWINRT" => Block::FWinRt,
        "FWINLTSKIP" => Block::FWinLtSkip,
        "FWINRTSKIP" => Block::FWinRtSkip,
        "ROUTE" => Block::Route,
        "HOME" => Block::Home,
        "RESTART" => Block::Restart,
        other => return Err(err(format!("unknown command {other:?}"))),
    };
    Ok((block, arg))
}

fn build_binding(parsed: ParsedBind) -> KeyBinding {
    /* The last key named in a chord is the "immediate" trigger; every key
     * before it is a held modifier. A single-key bind has no modifiers and
     * its one key is immediate. Routing binds use the group wildcard
     * instead, handled by the `ROUTE` special case below. */
    let (modifiers, immediate) = if parsed.block == Block::Route {
        let routing_key = *parsed
            .key_ids
            .last()
            .expect("bind requires at least one key");
        let modifiers = parsed.key_ids[..parsed.key_ids.len() - 1].to_vec();
        (modifiers, ImmediateMatch::AnyInGroup(routing_key.group))
    } else {
        let mut modifiers = parsed.key_ids.clone();
        let immediate_key = modifiers.pop();
        (
            modifiers,
            match immediate_key {
                Some(k) => ImmediateMatch::Specific(k),
                None => ImmediateMatch::None,
            },
        )
    };

    let mut flag_bits = BindingFlags::empty();
    if parsed.hidden {
        flag_bits |= BindingFlags::HIDDEN;
    }
    if parsed.long_press {
        flag_bits |= BindingFlags::LONG_PRESS;
    }
    if immediate.is_specific() {
        flag_bits |= BindingFlags::IMMEDIATE;
    }

    KeyBinding {
        combination: Combination::new(modifiers, immediate),
        command: Command::new(parsed.block, parsed.flags, parsed.arg),
        flags: flag_bits,
        key_names: parsed.keys,
    }
}

/* If a binding maps a routing key to the ROUTE command without the
 * immediate-flag, the matcher additionally emits a synthetic binding for
 * ROUTE | LONG_PRESS so that long-press on a routing key is always
 * available. This applies only to the bare, unflagged ROUTE block, never
 * to ROUTE variants that already carry other argument bits, and only when
 * the match has no specific immediate key (i.e. it is the routing
 * wildcard). */
fn synthesize_routing_long_press(bindings: &mut HashMap<Context, Vec<KeyBinding>>) {
    for bindings in bindings.values_mut() {
        let mut synthetic = Vec::new();
        for binding in bindings.iter() {
            let is_bare_route = binding.command.block() == Some(Block::Route)
                && binding.command.flags() == 0
                && binding.command.arg() == 0
                && !binding.flags.contains(BindingFlags::IMMEDIATE)
                && matches!(binding.combination.immediate, ImmediateMatch::AnyInGroup(_));
            if is_bare_route && !binding.flags.contains(BindingFlags::LONG_PRESS) {
                let mut long_press_flags = binding.flags;
                long_press_flags |= BindingFlags::LONG_PRESS | BindingFlags::SYNTHETIC;
                synthetic.push(KeyBinding {
                    combination: binding.combination.clone(),
                    command: Command::new(Block::Route, FLG_LONG_PRESS, 0),
                    flags: long_press_flags,
                    key_names: binding.key_names.clone(),
                });
            }
        }
        bindings.extend(synthetic);
    }
}
