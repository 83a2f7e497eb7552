//! Unit tests for the dispatch loop

use super::*;
use crate::pattern::{DictFieldPattern, Pattern};

fn program(instructions: Vec<Instruction>) -> Program {
    let mut p = Program::new();
    for instruction in instructions {
        p.emit(instruction);
    }
    p
}

fn run_program(instructions: Vec<Instruction>) -> Value {
    Vm::new(program(instructions)).run().unwrap()
}

fn push_int(n: i64) -> Instruction {
    Instruction::with_int(Opcode::PushInt, 1, n)
}

fn op(opcode: Opcode) -> Instruction {
    Instruction::new(opcode, 1)
}

fn named(opcode: Opcode, name: &str) -> Instruction {
    Instruction::with_string(opcode, 1, name)
}

mod stack_ops {
    use super::*;

    #[test]
    fn test_push_and_halt_returns_top() {
        let result = run_program(vec![push_int(7), op(Opcode::Halt)]);
        assert_eq!(result, Value::I64(7));
    }

    #[test]
    fn test_empty_program_returns_nil() {
        assert_eq!(run_program(vec![]), Value::Nil);
    }

    #[test]
    fn test_dup_and_swap() {
        let result = run_program(vec![
            push_int(1),
            push_int(2),
            op(Opcode::Swap),
            op(Opcode::Dup),
            op(Opcode::Subtract),
        ]);
        // [1,2] -> swap [2,1] -> dup [2,1,1] -> sub [2,0]
        assert_eq!(result, Value::I64(0));
    }

    #[test]
    fn test_pop_underflow_is_fatal() {
        let err = Vm::new(program(vec![op(Opcode::Pop)])).run().unwrap_err();
        assert!(matches!(err, VmError::StackUnderflow { .. }));
    }

    #[test]
    fn test_stack_overflow_respects_limits() {
        let mut p = Program::new();
        let loop_head = p.emit(push_int(1));
        let jump = p.emit(op(Opcode::Jump));
        p.patch_jump(jump, loop_head);
        let mut vm = Vm::with_limits(p, ResourceLimits::testing());
        assert!(matches!(vm.run(), Err(VmError::StackOverflow { .. })));
    }

    #[test]
    fn test_statement_stack_balance() {
        // A declaration statement and an expression statement both leave the
        // operand stack where they found it
        let mut vm = Vm::new(program(vec![
            push_int(1),
            named(Opcode::DeclareVar, "x"),
            push_int(5),
            op(Opcode::Pop),
        ]));
        let result = vm.run().unwrap();
        assert_eq!(result, Value::Nil);
        assert!(vm.stack().is_empty());
    }
}

mod arithmetic {
    use super::*;

    #[test]
    fn test_integer_arithmetic() {
        assert_eq!(
            run_program(vec![push_int(6), push_int(7), op(Opcode::Multiply)]),
            Value::I64(42)
        );
        assert_eq!(
            run_program(vec![push_int(7), push_int(2), op(Opcode::Modulo)]),
            Value::I64(1)
        );
        assert_eq!(
            run_program(vec![push_int(2), push_int(10), op(Opcode::Power)]),
            Value::I64(1024)
        );
        assert_eq!(
            run_program(vec![push_int(5), op(Opcode::Negate)]),
            Value::I64(-5)
        );
    }

    #[test]
    fn test_mixed_operands_promote() {
        let result = run_program(vec![
            push_int(3),
            Instruction::with_float(Opcode::PushFloat, 1, 0.5),
            op(Opcode::Multiply),
        ]);
        assert_eq!(result, Value::F64(1.5));
    }

    #[test]
    fn test_division_by_zero_unhandled_aborts() {
        let err = Vm::new(program(vec![push_int(1), push_int(0), op(Opcode::Divide)]))
            .run()
            .unwrap_err();
        match err {
            VmError::UnhandledError { error, .. } => {
                assert_eq!(error.error_type, "DivisionByZero")
            }
            other => panic!("expected unhandled error, got {}", other),
        }
    }

    #[test]
    fn test_concat_and_interpolate() {
        let result = run_program(vec![
            named(Opcode::PushString, "n = "),
            push_int(3),
            op(Opcode::Concat),
        ]);
        assert_eq!(result, Value::String("n = 3".to_string()));

        let result = run_program(vec![
            named(Opcode::PushString, "a"),
            push_int(1),
            named(Opcode::PushString, "b"),
            Instruction::with_int(Opcode::InterpolateString, 1, 3),
        ]);
        assert_eq!(result, Value::String("a1b".to_string()));
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(
            run_program(vec![push_int(1), push_int(2), op(Opcode::Less)]),
            Value::Bool(true)
        );
        assert_eq!(
            run_program(vec![
                Instruction::with_bool(Opcode::PushBool, 1, true),
                Instruction::with_bool(Opcode::PushBool, 1, false),
                op(Opcode::Or),
            ]),
            Value::Bool(true)
        );
        assert_eq!(
            run_program(vec![
                Instruction::with_bool(Opcode::PushBool, 1, true),
                op(Opcode::Not),
            ]),
            Value::Bool(false)
        );
        // Equality crosses widths
        assert_eq!(
            run_program(vec![push_int(1), push_int(1), op(Opcode::Equal)]),
            Value::Bool(true)
        );
    }
}

mod control_flow {
    use super::*;

    #[test]
    fn test_conditional_jump() {
        // if false { 1 } else { 2 }
        let mut p = Program::new();
        p.emit(Instruction::with_bool(Opcode::PushBool, 1, false));
        let branch = p.emit(op(Opcode::JumpIfFalse));
        p.emit(push_int(1));
        let exit = p.emit(op(Opcode::Jump));
        let else_target = p.len();
        p.emit(push_int(2));
        let end = p.len();
        p.patch_jump(branch, else_target);
        p.patch_jump(exit, end);
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(2));
    }

    #[test]
    fn test_backward_jump_loop() {
        // sum 1..=4 with a counter
        let mut p = Program::new();
        p.emit(push_int(0));
        p.emit(named(Opcode::DeclareVar, "sum"));
        p.emit(push_int(1));
        p.emit(named(Opcode::DeclareVar, "i"));
        let loop_head = p.len();
        p.emit(named(Opcode::LoadVar, "i"));
        p.emit(push_int(5));
        p.emit(op(Opcode::Less));
        let exit = p.emit(op(Opcode::JumpIfFalse));
        p.emit(named(Opcode::LoadVar, "sum"));
        p.emit(named(Opcode::LoadVar, "i"));
        p.emit(op(Opcode::Add));
        p.emit(named(Opcode::StoreVar, "sum"));
        p.emit(named(Opcode::LoadVar, "i"));
        p.emit(push_int(1));
        p.emit(op(Opcode::Add));
        p.emit(named(Opcode::StoreVar, "i"));
        let back = p.emit(op(Opcode::Jump));
        p.patch_jump(back, loop_head);
        let end = p.len();
        p.patch_jump(exit, end);
        p.emit(named(Opcode::LoadVar, "sum"));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(10));
    }

    #[test]
    fn test_invalid_jump_target() {
        let err = Vm::new(program(vec![Instruction::with_int(Opcode::Jump, 1, -10)]))
            .run()
            .unwrap_err();
        assert!(matches!(err, VmError::InvalidJumpTarget { .. }));
    }
}

mod variables {
    use super::*;

    #[test]
    fn test_declare_load_store() {
        let result = run_program(vec![
            push_int(1),
            named(Opcode::DeclareVar, "x"),
            push_int(2),
            named(Opcode::StoreVar, "x"),
            named(Opcode::LoadVar, "x"),
        ]);
        assert_eq!(result, Value::I64(2));
    }

    #[test]
    fn test_load_undefined_is_fatal() {
        let err = Vm::new(program(vec![named(Opcode::LoadVar, "ghost")]))
            .run()
            .unwrap_err();
        assert!(matches!(err, VmError::UndefinedVariable { .. }));
    }

    #[test]
    fn test_store_undefined_is_fatal() {
        let err = Vm::new(program(vec![push_int(1), named(Opcode::StoreVar, "ghost")]))
            .run()
            .unwrap_err();
        assert!(matches!(err, VmError::UndefinedVariable { .. }));
    }

    #[test]
    fn test_scope_shadowing_restores_outer() {
        let result = run_program(vec![
            push_int(1),
            named(Opcode::DeclareVar, "x"),
            op(Opcode::BeginScope),
            push_int(2),
            named(Opcode::DeclareVar, "x"),
            named(Opcode::LoadVar, "x"),
            op(Opcode::Pop),
            op(Opcode::EndScope),
            named(Opcode::LoadVar, "x"),
        ]);
        assert_eq!(result, Value::I64(1));
    }

    #[test]
    fn test_inner_store_reaches_outer_binding() {
        let result = run_program(vec![
            push_int(1),
            named(Opcode::DeclareVar, "x"),
            op(Opcode::BeginScope),
            push_int(9),
            named(Opcode::StoreVar, "x"),
            op(Opcode::EndScope),
            named(Opcode::LoadVar, "x"),
        ]);
        assert_eq!(result, Value::I64(9));
    }

    #[test]
    fn test_remove_var() {
        let err = Vm::new(program(vec![
            push_int(1),
            named(Opcode::DeclareVar, "x"),
            named(Opcode::RemoveVar, "x"),
            named(Opcode::LoadVar, "x"),
        ]))
        .run()
        .unwrap_err();
        assert!(matches!(err, VmError::UndefinedVariable { .. }));
    }

    #[test]
    fn test_temp_slots() {
        let result = run_program(vec![
            push_int(5),
            Instruction::with_int(Opcode::StoreTemp, 1, 0),
            Instruction::with_int(Opcode::LoadTemp, 1, 0),
            Instruction::with_int(Opcode::LoadTemp, 1, 0),
            op(Opcode::Add),
        ]);
        assert_eq!(result, Value::I64(10));
    }
}

mod functions {
    use super::*;

    /// fn add(a, b) { return a + b }; parameters bind in reverse order
    fn emit_add_function(p: &mut Program) {
        p.emit(named(Opcode::BeginFunction, "add"));
        p.emit(named(Opcode::DefineParam, "b"));
        p.emit(named(Opcode::DefineParam, "a"));
        p.emit(named(Opcode::LoadVar, "a"));
        p.emit(named(Opcode::LoadVar, "b"));
        p.emit(op(Opcode::Add));
        p.emit(op(Opcode::Return));
        p.emit(named(Opcode::EndFunction, "add"));
    }

    #[test]
    fn test_call_and_return() {
        let mut p = Program::new();
        emit_add_function(&mut p);
        p.emit(push_int(2));
        p.emit(push_int(3));
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 2, "add"));
        let mut vm = Vm::new(p);
        assert_eq!(vm.run().unwrap(), Value::I64(5));
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn test_implicit_nil_return() {
        let mut p = Program::new();
        p.emit(named(Opcode::BeginFunction, "noop"));
        p.emit(named(Opcode::EndFunction, "noop"));
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 0, "noop"));
        assert_eq!(Vm::new(p).run().unwrap(), Value::Nil);
    }

    #[test]
    fn test_undefined_function_is_fatal() {
        let err = Vm::new(program(vec![Instruction::with_int_string(
            Opcode::Call,
            1,
            0,
            "ghost",
        )]))
        .run()
        .unwrap_err();
        assert!(matches!(err, VmError::UndefinedFunction { .. }));
    }

    #[test]
    fn test_recursion() {
        // fn countdown(n) { if n <= 0 { return 0 } return countdown(n - 1) }
        let mut p = Program::new();
        p.emit(named(Opcode::BeginFunction, "countdown"));
        p.emit(named(Opcode::DefineParam, "n"));
        p.emit(named(Opcode::LoadVar, "n"));
        p.emit(push_int(0));
        p.emit(op(Opcode::LessEqual));
        let branch = p.emit(op(Opcode::JumpIfFalse));
        p.emit(push_int(0));
        p.emit(op(Opcode::Return));
        let recurse = p.len();
        p.emit(named(Opcode::LoadVar, "n"));
        p.emit(push_int(1));
        p.emit(op(Opcode::Subtract));
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 1, "countdown"));
        p.emit(op(Opcode::Return));
        p.emit(named(Opcode::EndFunction, "countdown"));
        p.patch_jump(branch, recurse);
        p.emit(push_int(10));
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 1, "countdown"));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(0));
    }

    #[test]
    fn test_call_depth_limit() {
        // fn forever() { return forever() }
        let mut p = Program::new();
        p.emit(named(Opcode::BeginFunction, "forever"));
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 0, "forever"));
        p.emit(op(Opcode::Return));
        p.emit(named(Opcode::EndFunction, "forever"));
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 0, "forever"));
        let mut vm = Vm::with_limits(p, ResourceLimits::testing());
        assert!(matches!(vm.run(), Err(VmError::CallStackOverflow { .. })));
    }

    #[test]
    fn test_optional_parameter_default() {
        // fn inc(a, step = 9) { return a + step }
        let mut p = Program::new();
        p.emit(named(Opcode::BeginFunction, "inc"));
        p.emit(Instruction::with_int_string(
            Opcode::DefineOptionalParam,
            1,
            1,
            "step",
        ));
        let skip_default = p.emit(op(Opcode::JumpIfTrue));
        p.emit(push_int(9));
        p.emit(named(Opcode::SetDefaultValue, "step"));
        let after_default = p.len();
        p.patch_jump(skip_default, after_default);
        p.emit(named(Opcode::DefineParam, "a"));
        p.emit(named(Opcode::LoadVar, "a"));
        p.emit(named(Opcode::LoadVar, "step"));
        p.emit(op(Opcode::Add));
        p.emit(op(Opcode::Return));
        p.emit(named(Opcode::EndFunction, "inc"));

        let one_arg = p.len();
        p.emit(push_int(1));
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 1, "inc"));
        assert_eq!(Vm::new(p.clone()).run().unwrap(), Value::I64(10));

        // With both arguments supplied the default is skipped
        p.instructions.truncate(one_arg);
        p.emit(push_int(1));
        p.emit(push_int(100));
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 2, "inc"));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(101));
    }

    #[test]
    fn test_native_function() {
        let mut p = Program::new();
        p.emit(push_int(21));
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 1, "double"));
        let mut vm = Vm::new(p);
        vm.register_native("double", |args| {
            let n = args[0].as_i64().unwrap();
            Ok(Value::I64(n * 2))
        });
        assert_eq!(vm.run().unwrap(), Value::I64(42));
    }

    #[test]
    fn test_vm_aware_native() {
        let mut p = Program::new();
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 0, "whoami"));
        let mut vm = Vm::new(p);
        vm.set_global("name", Value::String("keel".to_string()));
        vm.register_native_with_vm("whoami", |vm, _args| {
            Ok(vm.get_global("name").unwrap_or(Value::Nil))
        });
        assert_eq!(vm.run().unwrap(), Value::String("keel".to_string()));
    }

    #[test]
    fn test_native_error_feeds_error_union() {
        let mut p = Program::new();
        let frame = p.emit(named(Opcode::PushErrorFrame, ""));
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 0, "fail"));
        p.emit(op(Opcode::PopErrorFrame));
        let exit = p.emit(op(Opcode::Jump));
        let handler = p.len();
        p.emit(named(Opcode::StoreException, "e"));
        p.emit(named(Opcode::PushString, "recovered"));
        let end = p.len();
        p.patch_jump(frame, handler);
        p.patch_jump(exit, end);

        let mut vm = Vm::new(p);
        vm.register_native("fail", |_args| {
            Err(ErrorValue::new("NetworkError", "unreachable", 4))
        });
        assert_eq!(vm.run().unwrap(), Value::String("recovered".to_string()));
    }
}

mod closures {
    use super::*;

    #[test]
    fn test_capture_by_value_at_creation() {
        // x = 1; f = || x; x = 2; f() must return 1
        let mut p = Program::new();
        p.emit(push_int(1));
        p.emit(named(Opcode::DeclareVar, "x"));
        p.emit(named(Opcode::BeginFunction, "lambda0"));
        p.emit(named(Opcode::LoadVar, "x"));
        p.emit(op(Opcode::Return));
        p.emit(named(Opcode::EndFunction, "lambda0"));
        p.emit(named(Opcode::PushString, "x"));
        p.emit(Instruction::with_int_string(
            Opcode::CreateClosure,
            1,
            1,
            "lambda0",
        ));
        p.emit(named(Opcode::DeclareVar, "f"));
        p.emit(push_int(2));
        p.emit(named(Opcode::StoreVar, "x"));
        p.emit(named(Opcode::LoadVar, "f"));
        p.emit(Instruction::with_int(Opcode::CallClosure, 1, 0));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(1));
    }

    #[test]
    fn test_closure_with_arguments() {
        // base = 10; f = |n| base + n; f(5)
        let mut p = Program::new();
        p.emit(push_int(10));
        p.emit(named(Opcode::DeclareVar, "base"));
        p.emit(named(Opcode::BeginFunction, "lambda0"));
        p.emit(named(Opcode::DefineParam, "n"));
        p.emit(named(Opcode::LoadVar, "base"));
        p.emit(named(Opcode::LoadVar, "n"));
        p.emit(op(Opcode::Add));
        p.emit(op(Opcode::Return));
        p.emit(named(Opcode::EndFunction, "lambda0"));
        p.emit(named(Opcode::PushString, "base"));
        p.emit(Instruction::with_int_string(
            Opcode::CreateClosure,
            1,
            1,
            "lambda0",
        ));
        p.emit(named(Opcode::DeclareVar, "f"));
        p.emit(push_int(5));
        p.emit(named(Opcode::LoadVar, "f"));
        p.emit(Instruction::with_int(Opcode::CallClosure, 1, 1));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(15));
    }

    #[test]
    fn test_closure_reaches_globals_without_capturing() {
        // A function defined after closure creation is still callable inside
        let mut p = Program::new();
        p.emit(named(Opcode::BeginFunction, "lambda0"));
        p.emit(named(Opcode::LoadVar, "g"));
        p.emit(op(Opcode::Return));
        p.emit(named(Opcode::EndFunction, "lambda0"));
        p.emit(Instruction::with_int_string(
            Opcode::CreateClosure,
            1,
            0,
            "lambda0",
        ));
        p.emit(named(Opcode::DeclareVar, "f"));
        p.emit(push_int(77));
        p.emit(named(Opcode::DeclareVar, "g"));
        p.emit(named(Opcode::LoadVar, "f"));
        p.emit(Instruction::with_int(Opcode::CallClosure, 1, 0));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(77));
    }

    #[test]
    fn test_closure_capture_is_isolated_per_creation() {
        // Two closures over the same name capture different snapshots
        let mut p = Program::new();
        p.emit(named(Opcode::BeginFunction, "lambda0"));
        p.emit(named(Opcode::LoadVar, "x"));
        p.emit(op(Opcode::Return));
        p.emit(named(Opcode::EndFunction, "lambda0"));
        p.emit(push_int(1));
        p.emit(named(Opcode::DeclareVar, "x"));
        p.emit(named(Opcode::PushString, "x"));
        p.emit(Instruction::with_int_string(Opcode::CreateClosure, 1, 1, "lambda0"));
        p.emit(named(Opcode::DeclareVar, "f1"));
        p.emit(push_int(2));
        p.emit(named(Opcode::StoreVar, "x"));
        p.emit(named(Opcode::PushString, "x"));
        p.emit(Instruction::with_int_string(Opcode::CreateClosure, 1, 1, "lambda0"));
        p.emit(named(Opcode::DeclareVar, "f2"));
        p.emit(named(Opcode::LoadVar, "f1"));
        p.emit(Instruction::with_int(Opcode::CallClosure, 1, 0));
        p.emit(named(Opcode::LoadVar, "f2"));
        p.emit(Instruction::with_int(Opcode::CallClosure, 1, 0));
        p.emit(op(Opcode::Add));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(3));
    }
}

mod error_unions {
    use super::*;

    #[test]
    fn test_ok_round_trip() {
        let result = run_program(vec![
            push_int(5),
            op(Opcode::ConstructOk),
            op(Opcode::UnwrapValue),
        ]);
        assert_eq!(result, Value::I64(5));
    }

    #[test]
    fn test_construct_error_preserves_fields() {
        let mut p = Program::new();
        p.emit(named(Opcode::PushString, "bad digit"));
        p.emit(push_int(3));
        p.emit(Instruction::with_int_string(
            Opcode::ConstructError,
            7,
            2,
            "ParseError",
        ));
        let result = Vm::new(p).run().unwrap();
        let error = result.error_value().expect("expected an error union");
        assert_eq!(error.error_type, "ParseError");
        assert_eq!(error.message, "bad digit");
        assert_eq!(
            error.arguments,
            vec![Value::String("bad digit".to_string()), Value::I64(3)]
        );
        assert_eq!(error.line, 7);
    }

    #[test]
    fn test_check_error_peeks() {
        let mut vm = Vm::new(program(vec![
            push_int(1),
            op(Opcode::ConstructOk),
            op(Opcode::CheckError),
        ]));
        let result = vm.run().unwrap();
        assert_eq!(result, Value::Bool(false));
        // The checked union is still on the stack under the popped bool
        assert_eq!(vm.stack().len(), 1);
    }

    #[test]
    fn test_is_error_and_is_success() {
        let result = run_program(vec![
            named(Opcode::PushString, "boom"),
            Instruction::with_int_string(Opcode::ConstructError, 1, 1, "IOError"),
            op(Opcode::IsError),
        ]);
        assert_eq!(result, Value::Bool(true));

        let result = run_program(vec![
            push_int(1),
            op(Opcode::ConstructOk),
            op(Opcode::IsSuccess),
        ]);
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn test_handler_catches_and_produces_value() {
        let mut p = Program::new();
        let frame = p.emit(named(Opcode::PushErrorFrame, ""));
        p.emit(push_int(1));
        p.emit(push_int(0));
        p.emit(op(Opcode::Divide));
        p.emit(op(Opcode::PopErrorFrame));
        let exit = p.emit(op(Opcode::Jump));
        let handler = p.len();
        p.emit(named(Opcode::StoreException, "e"));
        p.emit(push_int(-1));
        let end = p.len();
        p.patch_jump(frame, handler);
        p.patch_jump(exit, end);

        let mut vm = Vm::new(p);
        assert_eq!(vm.run().unwrap(), Value::I64(-1));
        match vm.get_global("e") {
            Some(Value::Error(error)) => assert_eq!(error.error_type, "DivisionByZero"),
            other => panic!("expected bound error, got {:?}", other),
        }
    }

    #[test]
    fn test_success_path_pops_frame_untouched() {
        let mut p = Program::new();
        let frame = p.emit(named(Opcode::PushErrorFrame, ""));
        p.emit(push_int(4));
        p.emit(push_int(2));
        p.emit(op(Opcode::Divide));
        p.emit(op(Opcode::PopErrorFrame));
        let exit = p.emit(op(Opcode::Jump));
        let handler = p.len();
        p.emit(named(Opcode::StoreException, "e"));
        p.emit(push_int(-1));
        let end = p.len();
        p.patch_jump(frame, handler);
        p.patch_jump(exit, end);
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(2));
    }

    #[test]
    fn test_typed_handler_mismatch_walks_outward() {
        // Outer wildcard handler, inner IOError handler; a ParseError skips
        // the inner frame and lands in the outer one
        let mut p = Program::new();
        let outer = p.emit(named(Opcode::PushErrorFrame, ""));
        let inner = p.emit(named(Opcode::PushErrorFrame, "IOError"));
        p.emit(named(Opcode::PushString, "nope"));
        p.emit(Instruction::with_int_string(
            Opcode::ConstructError,
            1,
            1,
            "ParseError",
        ));
        p.emit(op(Opcode::PropagateError));
        p.emit(op(Opcode::PopErrorFrame));
        p.emit(op(Opcode::PopErrorFrame));
        let exit0 = p.emit(op(Opcode::Jump));
        let inner_handler = p.len();
        p.emit(named(Opcode::PushString, "inner"));
        let exit1 = p.emit(op(Opcode::Jump));
        let outer_handler = p.len();
        p.emit(op(Opcode::Pop));
        p.emit(named(Opcode::PushString, "outer"));
        let end = p.len();
        p.patch_jump(outer, outer_handler);
        p.patch_jump(inner, inner_handler);
        p.patch_jump(exit0, end);
        p.patch_jump(exit1, end);
        assert_eq!(
            Vm::new(p).run().unwrap(),
            Value::String("outer".to_string())
        );
    }

    #[test]
    fn test_error_returns_from_function_to_caller_handler() {
        // fn may_fail() { return err(IOError) }; caller unwraps under a handler
        let mut p = Program::new();
        p.emit(named(Opcode::BeginFunction, "may_fail"));
        p.emit(named(Opcode::PushString, "disk gone"));
        p.emit(Instruction::with_int_string(
            Opcode::ConstructError,
            2,
            1,
            "IOError",
        ));
        p.emit(op(Opcode::PropagateError));
        p.emit(op(Opcode::Return));
        p.emit(named(Opcode::EndFunction, "may_fail"));

        let frame = p.emit(named(Opcode::PushErrorFrame, ""));
        p.emit(Instruction::with_int_string(Opcode::Call, 3, 0, "may_fail"));
        p.emit(op(Opcode::UnwrapValue));
        p.emit(op(Opcode::PopErrorFrame));
        let exit = p.emit(op(Opcode::Jump));
        let handler = p.len();
        p.emit(named(Opcode::StoreException, "e"));
        p.emit(named(Opcode::PushString, "handled"));
        let end = p.len();
        p.patch_jump(frame, handler);
        p.patch_jump(exit, end);

        let mut vm = Vm::new(p);
        assert_eq!(vm.run().unwrap(), Value::String("handled".to_string()));
        assert_eq!(vm.call_depth(), 0);
        match vm.get_global("e") {
            Some(Value::Error(error)) => {
                assert_eq!(error.error_type, "IOError");
                assert_eq!(error.message, "disk gone");
            }
            other => panic!("expected bound error, got {:?}", other),
        }
    }

    #[test]
    fn test_unhandled_error_reaches_top_with_diagnostics() {
        let mut p = Program::new();
        p.emit(named(Opcode::PushString, "boom"));
        p.emit(Instruction::with_int_string(
            Opcode::ConstructError,
            12,
            1,
            "NetworkError",
        ));
        p.emit(op(Opcode::UnwrapValue));
        let err = Vm::new(p).run().unwrap_err();
        match err {
            VmError::UnhandledError { error, line } => {
                assert_eq!(error.error_type, "NetworkError");
                assert_eq!(error.message, "boom");
                assert_eq!(line, 12);
            }
            other => panic!("expected unhandled error, got {}", other),
        }
    }

    #[test]
    fn test_unwrap_passes_plain_values_through() {
        let result = run_program(vec![push_int(3), op(Opcode::UnwrapValue)]);
        assert_eq!(result, Value::I64(3));
    }
}

mod pattern_dispatch {
    use super::*;

    /// match subject { 1 -> "a", _ -> "b" }
    fn first_match_program(subject: i64) -> Program {
        let mut p = Program::new();
        let literal = p.add_pattern(Pattern::Literal(Value::I64(1)));
        let wildcard = p.add_pattern(Pattern::wildcard());
        p.emit(push_int(subject));
        p.emit(named(Opcode::DeclareVar, "subject"));
        p.emit(named(Opcode::LoadVar, "subject"));
        p.emit(Instruction::with_int(Opcode::MatchPattern, 1, literal));
        let to_case2 = p.emit(op(Opcode::JumpIfFalse));
        p.emit(named(Opcode::PushString, "a"));
        let exit = p.emit(op(Opcode::Jump));
        let case2 = p.len();
        p.emit(named(Opcode::LoadVar, "subject"));
        p.emit(Instruction::with_int(Opcode::MatchPattern, 1, wildcard));
        p.emit(op(Opcode::Pop));
        p.emit(named(Opcode::PushString, "b"));
        let end = p.len();
        p.patch_jump(to_case2, case2);
        p.patch_jump(exit, end);
        p
    }

    #[test]
    fn test_first_match_wins() {
        assert_eq!(
            Vm::new(first_match_program(1)).run().unwrap(),
            Value::String("a".to_string())
        );
        assert_eq!(
            Vm::new(first_match_program(2)).run().unwrap(),
            Value::String("b".to_string())
        );
    }

    #[test]
    fn test_guard_failure_falls_to_next_case() {
        // match subject { n if n > 10 -> "big", _ -> "small" }
        let mut p = Program::new();
        let bind_n = p.add_pattern(Pattern::binding("n"));
        let wildcard = p.add_pattern(Pattern::wildcard());
        p.emit(push_int(5));
        p.emit(named(Opcode::DeclareVar, "subject"));
        p.emit(named(Opcode::LoadVar, "subject"));
        p.emit(Instruction::with_int(Opcode::MatchPattern, 1, bind_n));
        let to_case2a = p.emit(op(Opcode::JumpIfFalse));
        // Guard runs with the pattern's bindings visible
        p.emit(named(Opcode::LoadVar, "n"));
        p.emit(push_int(10));
        p.emit(op(Opcode::Greater));
        let to_case2b = p.emit(op(Opcode::JumpIfFalse));
        p.emit(named(Opcode::PushString, "big"));
        let exit = p.emit(op(Opcode::Jump));
        let case2 = p.len();
        p.emit(named(Opcode::LoadVar, "subject"));
        p.emit(Instruction::with_int(Opcode::MatchPattern, 1, wildcard));
        p.emit(op(Opcode::Pop));
        p.emit(named(Opcode::PushString, "small"));
        let end = p.len();
        p.patch_jump(to_case2a, case2);
        p.patch_jump(to_case2b, case2);
        p.patch_jump(exit, end);
        assert_eq!(
            Vm::new(p).run().unwrap(),
            Value::String("small".to_string())
        );
    }

    #[test]
    fn test_dict_rest_binding_through_bytecode() {
        let mut p = Program::new();
        let pattern = p.add_pattern(Pattern::Dict {
            fields: vec![DictFieldPattern {
                key: "a".to_string(),
                binding: None,
            }],
            rest: Some("rest".to_string()),
        });
        // {a: 1, b: 2, c: 3}
        p.emit(named(Opcode::PushString, "a"));
        p.emit(push_int(1));
        p.emit(named(Opcode::PushString, "b"));
        p.emit(push_int(2));
        p.emit(named(Opcode::PushString, "c"));
        p.emit(push_int(3));
        p.emit(Instruction::with_int(Opcode::CreateDict, 1, 3));
        p.emit(Instruction::with_int(Opcode::MatchPattern, 1, pattern));
        p.emit(op(Opcode::Pop));
        p.emit(named(Opcode::LoadVar, "a"));

        let mut vm = Vm::new(p);
        assert_eq!(vm.run().unwrap(), Value::I64(1));
        let rest = vm.get_global("rest").expect("rest bound");
        let expected = {
            let mut d = keel_core::value::DictValue::new();
            d.insert(keel_core::value::DictKey::Str("b".to_string()), Value::I64(2));
            d.insert(keel_core::value::DictKey::Str("c".to_string()), Value::I64(3));
            Value::dict(d)
        };
        assert!(rest.loose_eq(&expected));
    }

    #[test]
    fn test_err_pattern_dispatch() {
        let mut p = Program::new();
        let ok_pat = p.add_pattern(Pattern::Ok("v".to_string()));
        let err_pat = p.add_pattern(Pattern::Err {
            binding: "e".to_string(),
            error_type: Some("ParseError".to_string()),
        });
        p.emit(named(Opcode::PushString, "bad"));
        p.emit(Instruction::with_int_string(
            Opcode::ConstructError,
            1,
            1,
            "ParseError",
        ));
        p.emit(named(Opcode::DeclareVar, "result"));
        p.emit(named(Opcode::LoadVar, "result"));
        p.emit(Instruction::with_int(Opcode::MatchPattern, 1, ok_pat));
        let to_err = p.emit(op(Opcode::JumpIfFalse));
        p.emit(named(Opcode::PushString, "ok"));
        let exit = p.emit(op(Opcode::Jump));
        let err_case = p.len();
        p.emit(named(Opcode::LoadVar, "result"));
        p.emit(Instruction::with_int(Opcode::MatchPattern, 1, err_pat));
        p.emit(op(Opcode::Pop));
        p.emit(named(Opcode::PushString, "caught"));
        let end = p.len();
        p.patch_jump(to_err, err_case);
        p.patch_jump(exit, end);
        assert_eq!(
            Vm::new(p).run().unwrap(),
            Value::String("caught".to_string())
        );
    }
}

mod collections {
    use super::*;

    #[test]
    fn test_list_create_append_index() {
        let result = run_program(vec![
            push_int(1),
            push_int(2),
            Instruction::with_int(Opcode::CreateList, 1, 2),
            push_int(3),
            op(Opcode::ListAppend),
            push_int(2),
            op(Opcode::GetIndex),
        ]);
        assert_eq!(result, Value::I64(3));
    }

    #[test]
    fn test_list_set_index_mutates_in_place() {
        let result = run_program(vec![
            push_int(1),
            Instruction::with_int(Opcode::CreateList, 1, 1),
            named(Opcode::DeclareVar, "xs"),
            named(Opcode::LoadVar, "xs"),
            push_int(0),
            push_int(9),
            op(Opcode::SetIndex),
            named(Opcode::LoadVar, "xs"),
            push_int(0),
            op(Opcode::GetIndex),
        ]);
        assert_eq!(result, Value::I64(9));
    }

    #[test]
    fn test_index_out_of_bounds_is_recoverable() {
        let mut p = Program::new();
        let frame = p.emit(named(Opcode::PushErrorFrame, "IndexOutOfBounds"));
        p.emit(push_int(1));
        p.emit(Instruction::with_int(Opcode::CreateList, 1, 1));
        p.emit(push_int(5));
        p.emit(op(Opcode::GetIndex));
        p.emit(op(Opcode::PopErrorFrame));
        let exit = p.emit(op(Opcode::Jump));
        let handler = p.len();
        p.emit(op(Opcode::Pop));
        p.emit(named(Opcode::PushString, "oob"));
        let end = p.len();
        p.patch_jump(frame, handler);
        p.patch_jump(exit, end);
        assert_eq!(Vm::new(p).run().unwrap(), Value::String("oob".to_string()));
    }

    #[test]
    fn test_dict_create_set_get() {
        let result = run_program(vec![
            named(Opcode::PushString, "a"),
            push_int(1),
            Instruction::with_int(Opcode::CreateDict, 1, 1),
            named(Opcode::PushString, "b"),
            push_int(2),
            op(Opcode::DictSet),
            named(Opcode::PushString, "b"),
            op(Opcode::GetIndex),
        ]);
        assert_eq!(result, Value::I64(2));
    }

    #[test]
    fn test_tuple_index() {
        let result = run_program(vec![
            push_int(1),
            named(Opcode::PushString, "two"),
            Instruction::with_int(Opcode::CreateTuple, 1, 2),
            push_int(1),
            op(Opcode::GetIndex),
        ]);
        assert_eq!(result, Value::String("two".to_string()));
    }

    #[test]
    fn test_range_index_and_step() {
        let result = run_program(vec![
            push_int(0),
            push_int(10),
            op(Opcode::CreateRange),
            push_int(2),
            op(Opcode::SetRangeStep),
            push_int(3),
            op(Opcode::GetIndex),
        ]);
        assert_eq!(result, Value::I64(6));
    }

    #[test]
    fn test_string_index() {
        let result = run_program(vec![
            named(Opcode::PushString, "abc"),
            push_int(1),
            op(Opcode::GetIndex),
        ]);
        assert_eq!(result, Value::String("b".to_string()));
    }
}

mod iterators {
    use super::*;

    /// iter = get_iterator(subject); sum = 0; while has_next { sum += next }
    fn sum_with_iterator(p: &mut Program) {
        p.emit(push_int(0));
        p.emit(named(Opcode::DeclareVar, "sum"));
        p.emit(op(Opcode::GetIterator));
        let loop_head = p.len();
        p.emit(op(Opcode::IteratorHasNext));
        let exit = p.emit(op(Opcode::JumpIfFalse));
        p.emit(op(Opcode::IteratorNext));
        p.emit(named(Opcode::LoadVar, "sum"));
        p.emit(op(Opcode::Add));
        p.emit(named(Opcode::StoreVar, "sum"));
        let back = p.emit(op(Opcode::Jump));
        p.patch_jump(back, loop_head);
        let after = p.len();
        p.patch_jump(exit, after);
        p.emit(op(Opcode::Pop));
        p.emit(named(Opcode::LoadVar, "sum"));
    }

    #[test]
    fn test_list_iteration() {
        let mut p = Program::new();
        p.emit(push_int(1));
        p.emit(push_int(2));
        p.emit(push_int(3));
        p.emit(Instruction::with_int(Opcode::CreateList, 1, 3));
        sum_with_iterator(&mut p);
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(6));
    }

    #[test]
    fn test_range_iteration() {
        let mut p = Program::new();
        p.emit(push_int(0));
        p.emit(push_int(5));
        p.emit(op(Opcode::CreateRange));
        sum_with_iterator(&mut p);
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(10));
    }

    #[test]
    fn test_dict_key_value_iteration() {
        let mut p = Program::new();
        p.emit(named(Opcode::PushString, "a"));
        p.emit(push_int(5));
        p.emit(Instruction::with_int(Opcode::CreateDict, 1, 1));
        p.emit(op(Opcode::GetIterator));
        p.emit(op(Opcode::IteratorHasNext));
        p.emit(op(Opcode::Pop));
        p.emit(op(Opcode::IteratorNextKeyValue));
        // Stack: [iter, key, value]
        let mut vm = Vm::new(p);
        let value = vm.run().unwrap();
        assert_eq!(value, Value::I64(5));
        assert_eq!(vm.stack().len(), 2);
        assert_eq!(vm.stack()[1], Value::String("a".to_string()));
    }

    #[test]
    fn test_exhaustion_is_permanent() {
        let mut p = Program::new();
        p.emit(Instruction::with_int(Opcode::CreateList, 1, 0));
        p.emit(op(Opcode::GetIterator));
        p.emit(op(Opcode::IteratorHasNext));
        p.emit(op(Opcode::Pop));
        p.emit(op(Opcode::IteratorHasNext));
        assert_eq!(Vm::new(p).run().unwrap(), Value::Bool(false));
    }
}

mod concurrency {
    use super::*;

    #[test]
    fn test_task_and_await() {
        let mut p = Program::new();
        p.emit(op(Opcode::BeginTask));
        p.emit(push_int(7));
        p.emit(op(Opcode::EndTask));
        p.emit(op(Opcode::Await));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(7));
    }

    #[test]
    fn test_parallel_block_collects_results() {
        let mut p = Program::new();
        p.emit(op(Opcode::BeginParallel));
        p.emit(op(Opcode::BeginTask));
        p.emit(push_int(1));
        p.emit(op(Opcode::EndTask));
        p.emit(op(Opcode::BeginTask));
        p.emit(push_int(2));
        p.emit(op(Opcode::EndTask));
        p.emit(op(Opcode::EndParallel));
        let result = Vm::new(p).run().unwrap();
        assert!(result.loose_eq(&Value::list(vec![Value::I64(1), Value::I64(2)])));
    }

    #[test]
    fn test_failing_task_does_not_affect_siblings() {
        let mut p = Program::new();
        p.emit(op(Opcode::BeginParallel));
        p.emit(op(Opcode::BeginTask));
        p.emit(named(Opcode::PushString, "boom"));
        p.emit(Instruction::with_int_string(
            Opcode::ConstructError,
            1,
            1,
            "IOError",
        ));
        p.emit(op(Opcode::PropagateError));
        p.emit(op(Opcode::EndTask));
        p.emit(op(Opcode::BeginTask));
        p.emit(push_int(2));
        p.emit(op(Opcode::EndTask));
        p.emit(op(Opcode::EndParallel));
        let result = Vm::new(p).run().unwrap();
        match &result {
            Value::List(items) => {
                let items = items.read();
                assert_eq!(items.len(), 2);
                assert!(matches!(&items[0], Value::Error(e) if e.error_type == "IOError"));
                assert_eq!(items[1], Value::I64(2));
            }
            other => panic!("expected result list, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_block_raises_first_error() {
        let mut p = Program::new();
        p.emit(op(Opcode::BeginConcurrent));
        p.emit(op(Opcode::BeginTask));
        p.emit(named(Opcode::PushString, "boom"));
        p.emit(Instruction::with_int_string(
            Opcode::ConstructError,
            1,
            1,
            "IOError",
        ));
        p.emit(op(Opcode::PropagateError));
        p.emit(op(Opcode::EndTask));
        p.emit(op(Opcode::EndConcurrent));
        let err = Vm::new(p).run().unwrap_err();
        match err {
            VmError::UnhandledError { error, .. } => assert_eq!(error.error_type, "IOError"),
            other => panic!("expected unhandled error, got {}", other),
        }
    }

    #[test]
    fn test_tasks_share_globals() {
        let mut p = Program::new();
        p.emit(push_int(11));
        p.emit(named(Opcode::DeclareVar, "base"));
        p.emit(op(Opcode::BeginTask));
        p.emit(named(Opcode::LoadVar, "base"));
        p.emit(push_int(1));
        p.emit(op(Opcode::Add));
        p.emit(op(Opcode::EndTask));
        p.emit(op(Opcode::Await));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(12));
    }

    #[test]
    fn test_atomic_counter_has_no_lost_updates() {
        // Two tasks increment one atomic 10_000 times each
        let mut p = Program::new();
        p.emit(push_int(0));
        p.emit(named(Opcode::DefineAtomic, "counter"));
        p.emit(op(Opcode::BeginParallel));
        for _ in 0..2 {
            p.emit(op(Opcode::BeginTask));
            p.emit(push_int(0));
            p.emit(named(Opcode::DeclareVar, "i"));
            let loop_head = p.len();
            p.emit(named(Opcode::LoadVar, "i"));
            p.emit(push_int(10_000));
            p.emit(op(Opcode::Less));
            let exit = p.emit(op(Opcode::JumpIfFalse));
            p.emit(named(Opcode::LoadVar, "counter"));
            p.emit(push_int(1));
            p.emit(op(Opcode::Add));
            p.emit(named(Opcode::StoreVar, "counter"));
            p.emit(named(Opcode::LoadVar, "i"));
            p.emit(push_int(1));
            p.emit(op(Opcode::Add));
            p.emit(named(Opcode::StoreVar, "i"));
            let back = p.emit(op(Opcode::Jump));
            p.patch_jump(back, loop_head);
            let end_task = p.len();
            p.patch_jump(exit, end_task);
            p.emit(op(Opcode::EndTask));
        }
        p.emit(op(Opcode::EndParallel));
        p.emit(op(Opcode::Pop));
        p.emit(named(Opcode::LoadVar, "counter"));
        let result = Vm::new(p).run().unwrap();
        assert_eq!(result.as_i64().unwrap(), 20_000);
    }

    #[test]
    fn test_channel_send_receive() {
        let mut p = Program::new();
        p.emit(op(Opcode::CreateChannel));
        p.emit(named(Opcode::DeclareVar, "ch"));
        p.emit(named(Opcode::LoadVar, "ch"));
        p.emit(push_int(42));
        p.emit(op(Opcode::ChannelSend));
        p.emit(op(Opcode::Pop));
        p.emit(named(Opcode::LoadVar, "ch"));
        p.emit(op(Opcode::ChannelReceive));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(42));
    }

    #[test]
    fn test_worker_drains_channel() {
        let mut p = Program::new();
        p.emit(op(Opcode::CreateChannel));
        p.emit(named(Opcode::DeclareVar, "ch"));
        for n in [1, 2] {
            p.emit(named(Opcode::LoadVar, "ch"));
            p.emit(push_int(n));
            p.emit(op(Opcode::ChannelSend));
            p.emit(op(Opcode::Pop));
        }
        p.emit(named(Opcode::LoadVar, "ch"));
        p.emit(op(Opcode::CloseChannel));
        p.emit(op(Opcode::Pop));

        p.emit(named(Opcode::LoadVar, "ch"));
        p.emit(named(Opcode::BeginWorker, "input"));
        p.emit(push_int(0));
        p.emit(named(Opcode::DeclareVar, "sum"));
        p.emit(named(Opcode::LoadVar, "input"));
        p.emit(op(Opcode::GetIterator));
        let loop_head = p.len();
        p.emit(op(Opcode::IteratorHasNext));
        let exit = p.emit(op(Opcode::JumpIfFalse));
        p.emit(op(Opcode::IteratorNext));
        p.emit(named(Opcode::LoadVar, "sum"));
        p.emit(op(Opcode::Add));
        p.emit(named(Opcode::StoreVar, "sum"));
        let back = p.emit(op(Opcode::Jump));
        p.patch_jump(back, loop_head);
        let after = p.len();
        p.patch_jump(exit, after);
        p.emit(op(Opcode::Pop));
        p.emit(named(Opcode::LoadVar, "sum"));
        p.emit(named(Opcode::EndWorker, ""));
        p.emit(op(Opcode::Await));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(3));
    }

    #[test]
    fn test_iterating_tasks_bind_loop_variable() {
        let mut p = Program::new();
        p.emit(op(Opcode::BeginParallel));
        p.emit(push_int(1));
        p.emit(push_int(2));
        p.emit(push_int(3));
        p.emit(Instruction::with_int(Opcode::CreateList, 1, 3));
        p.emit(named(Opcode::StoreIterable, "x"));
        p.emit(op(Opcode::SpawnIteratingTasks));
        p.emit(op(Opcode::BeginTask));
        p.emit(named(Opcode::LoadVar, "x"));
        p.emit(push_int(10));
        p.emit(op(Opcode::Multiply));
        p.emit(op(Opcode::EndTask));
        p.emit(op(Opcode::EndParallel));
        let result = Vm::new(p).run().unwrap();
        assert!(result.loose_eq(&Value::list(vec![
            Value::I64(10),
            Value::I64(20),
            Value::I64(30)
        ])));
    }
}

mod classes_and_enums {
    use super::*;

    #[test]
    fn test_class_fields_and_methods() {
        let mut p = Program::new();
        p.emit(named(Opcode::BeginClass, "Point"));
        p.emit(push_int(0));
        p.emit(named(Opcode::DefineField, "x"));
        p.emit(named(Opcode::BeginFunction, "get_x"));
        p.emit(op(Opcode::LoadThis));
        p.emit(named(Opcode::GetProperty, "x"));
        p.emit(op(Opcode::Return));
        p.emit(named(Opcode::EndFunction, "get_x"));
        p.emit(named(Opcode::EndClass, "Point"));

        p.emit(Instruction::with_int_string(Opcode::Call, 1, 0, "Point"));
        p.emit(named(Opcode::DeclareVar, "p"));
        p.emit(named(Opcode::LoadVar, "p"));
        p.emit(push_int(5));
        p.emit(named(Opcode::SetProperty, "x"));
        p.emit(named(Opcode::LoadVar, "p"));
        p.emit(named(Opcode::GetProperty, "get_x"));
        p.emit(Instruction::with_int(Opcode::CallClosure, 1, 0));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(5));
    }

    #[test]
    fn test_constructor_runs_init() {
        let mut p = Program::new();
        p.emit(named(Opcode::BeginClass, "Counter"));
        p.emit(push_int(0));
        p.emit(named(Opcode::DefineField, "n"));
        p.emit(named(Opcode::BeginFunction, "init"));
        p.emit(named(Opcode::DefineParam, "start"));
        p.emit(op(Opcode::LoadThis));
        p.emit(named(Opcode::LoadVar, "start"));
        p.emit(named(Opcode::SetProperty, "n"));
        p.emit(op(Opcode::Return));
        p.emit(named(Opcode::EndFunction, "init"));
        p.emit(named(Opcode::EndClass, "Counter"));

        p.emit(push_int(41));
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 1, "Counter"));
        p.emit(named(Opcode::GetProperty, "n"));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(41));
    }

    #[test]
    fn test_superclass_fields_inherited() {
        let mut p = Program::new();
        p.emit(named(Opcode::BeginClass, "Base"));
        p.emit(push_int(1));
        p.emit(named(Opcode::DefineField, "a"));
        p.emit(named(Opcode::EndClass, "Base"));
        p.emit(named(Opcode::BeginClass, "Derived"));
        p.emit(named(Opcode::SetSuperclass, "Base"));
        p.emit(push_int(2));
        p.emit(named(Opcode::DefineField, "b"));
        p.emit(named(Opcode::EndClass, "Derived"));
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 0, "Derived"));
        p.emit(named(Opcode::GetProperty, "a"));
        assert_eq!(Vm::new(p).run().unwrap(), Value::I64(1));
    }

    #[test]
    fn test_enum_variants() {
        let mut p = Program::new();
        p.emit(named(Opcode::BeginEnum, "Color"));
        p.emit(named(Opcode::DefineEnumVariant, "Red"));
        p.emit(named(Opcode::PushString, "i64"));
        p.emit(named(Opcode::DefineEnumVariantWithType, "Code"));
        p.emit(named(Opcode::EndEnum, "Color"));

        p.emit(named(Opcode::LoadVar, "Color.Red"));
        let mut vm = Vm::new(p);
        let red = vm.run().unwrap();
        assert_eq!(
            red,
            Value::EnumVariant {
                name: "Color.Red".to_string(),
                payload: None
            }
        );
    }

    #[test]
    fn test_enum_variant_with_payload() {
        let mut p = Program::new();
        p.emit(named(Opcode::BeginEnum, "Color"));
        p.emit(named(Opcode::PushString, "i64"));
        p.emit(named(Opcode::DefineEnumVariantWithType, "Code"));
        p.emit(named(Opcode::EndEnum, "Color"));
        p.emit(push_int(3));
        p.emit(Instruction::with_int_string(Opcode::Call, 1, 1, "Color.Code"));
        let result = Vm::new(p).run().unwrap();
        assert_eq!(
            result,
            Value::EnumVariant {
                name: "Color.Code".to_string(),
                payload: Some(Box::new(Value::I64(3)))
            }
        );
    }
}

mod modules {
    use super::*;
    use rustc_hash::FxHashMap;

    #[test]
    fn test_import_and_property_access() {
        let mut p = Program::new();
        p.emit(named(Opcode::Import, "math"));
        p.emit(named(Opcode::LoadVar, "math"));
        p.emit(named(Opcode::GetProperty, "pi"));
        let mut vm = Vm::new(p);
        let mut exports = FxHashMap::default();
        exports.insert("pi".to_string(), Value::F64(3.141592653589793));
        vm.register_module("math", exports);
        assert_eq!(vm.run().unwrap(), Value::F64(3.141592653589793));
    }

    #[test]
    fn test_missing_module_is_fatal() {
        let err = Vm::new(program(vec![named(Opcode::Import, "ghost")]))
            .run()
            .unwrap_err();
        assert!(matches!(err, VmError::ModuleError { .. }));
    }

    #[test]
    fn test_missing_export_is_fatal() {
        let mut p = Program::new();
        p.emit(named(Opcode::Import, "math"));
        p.emit(named(Opcode::LoadVar, "math"));
        p.emit(named(Opcode::GetProperty, "tau"));
        let mut vm = Vm::new(p);
        vm.register_module("math", FxHashMap::default());
        assert!(matches!(vm.run(), Err(VmError::ModuleError { .. })));
    }
}
