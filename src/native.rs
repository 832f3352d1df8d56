// The native-function extension library (§1, §6). spec.md treats this as
// an external collaborator and only specifies the `defineNative` interface;
// the set implemented here follows the original source's exact extension
// natives (see SPEC_FULL.md §B / §D) rather than inventing a broader
// standard library.

use crate::value::Value;
use crate::vm::Vm;

pub fn define_natives(vm: &mut Vm) {
    vm.define_native("clock", clock);
    vm.define_native("__argc", argc);
    vm.define_native("__argv", argv);
    vm.define_native("__chrat", chrat);
    vm.define_native("__strlen", strlen);
    vm.define_native("__strof", strof);
}

fn clock(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.start_time().elapsed().as_secs_f64()))
}

fn argc(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.script_args().len() as f64))
}

fn argv(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let i = args.first().and_then(|v| v.as_number()).ok_or("__argv expects a number index.")? as i64;
    if i < 0 {
        return Ok(Value::Nil);
    }
    match vm.script_args().get(i as usize) {
        Some(s) => {
            let bytes = s.clone().into_bytes();
            Ok(vm.intern_value(&bytes))
        }
        None => Ok(Value::Nil),
    }
}

fn chrat(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let s = args.first().and_then(|v| v.as_obj()).ok_or("__chrat expects a string.")?;
    let idx = args.get(1).and_then(|v| v.as_number()).ok_or("__chrat expects a number index.")? as i64;
    let bytes = vm.heap().get(s).as_string().ok_or("__chrat expects a string.")?.bytes.clone();
    if idx < 0 || idx as usize >= bytes.len() {
        return Ok(Value::Nil);
    }
    Ok(Value::Number(bytes[idx as usize] as f64))
}

fn strlen(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let s = args.first().and_then(|v| v.as_obj()).ok_or("__strlen expects a string.")?;
    let len = vm.heap().get(s).as_string().ok_or("__strlen expects a string.")?.bytes.len();
    Ok(Value::Number(len as f64))
}

fn strof(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let b = args.first().and_then(|v| v.as_number()).ok_or("__strof expects a number.")? as i64;
    if !(1..=255).contains(&b) {
        return Ok(Value::Nil);
    }
    Ok(vm.intern_value(&[b as u8]))
}

#[cfg(test)]
mod tests {
    use crate::vm::{InterpretResult, Vm};

    #[test]
    fn clock_returns_a_number() {
        assert_eq!(Vm::new().interpret("print clock() >= 0;"), InterpretResult::Ok);
    }

    #[test]
    fn string_helpers_round_trip() {
        let src = r#"print __strof(__chrat("hi", 0));"#;
        assert_eq!(Vm::new().interpret(src), InterpretResult::Ok);
    }

    #[test]
    fn argv_reflects_script_args() {
        let mut vm = Vm::new();
        vm.set_script_args(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(vm.interpret("print __argc(); print __argv(1);"), InterpretResult::Ok);
    }
}
