#![no_main]

use std::sync::Once;

use arbitrary::Arbitrary;
use bespoke_array::{
    Array, BespokeArray, LayoutRegistry, LoggingArray, LoggingProfile, RuntimeOptions, SortFunction,
    TypedValue,
};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Value {
    Null,
    Int(i64),
    Str(String),
}

impl From<&Value> for TypedValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => TypedValue::Null,
            Value::Int(i) => TypedValue::Int(*i),
            Value::Str(s) => TypedValue::str(s),
        }
    }
}

#[derive(Arbitrary, Debug)]
enum Op {
    SetInt(i8, Value),
    SetStr(String, Value),
    RemoveInt(i8),
    RemoveStr(String),
    Append(Value),
    Pop,
    Share,
    Sort(bool),
    ToDvArray,
    ToHackArr,
}

static INIT: Once = Once::new();

fn apply(array: Array, op: &Op) -> (Array, Option<TypedValue>) {
    match op {
        Op::SetInt(k, v) => (array.set_int(*k as i64, TypedValue::from(v)), None),
        Op::SetStr(k, v) => (array.set_str(k, TypedValue::from(v)), None),
        Op::RemoveInt(k) => (array.remove_int(*k as i64), None),
        Op::RemoveStr(k) => (array.remove_str(k), None),
        Op::Append(v) => (array.append(TypedValue::from(v)), None),
        Op::Pop => {
            let (array, value) = array.pop();
            (array, Some(value))
        }
        Op::Share => (array, None),
        Op::Sort(keys) => {
            let sf = if *keys {
                SortFunction::KSort
            } else {
                SortFunction::Sort
            };
            (array.sort(sf, None).into_array(), None)
        }
        Op::ToDvArray => (array.to_dv_array(), None),
        Op::ToHackArr => (array.to_hack_arr(), None),
    }
}

fuzz_target!(|ops: Vec<Op>| {
    INIT.call_once(|| {
        let _ = bespoke_array::init(&RuntimeOptions::default(), LayoutRegistry::new());
    });
    let profile = LoggingProfile::new("fuzz");
    let mut subject = LoggingArray::make(Array::vec([0, 1, 2]), profile);
    let mut shadow = Array::vec([0, 1, 2]);
    let mut kept = Vec::new();
    for op in &ops {
        if let Op::Share = op {
            kept.push(subject.clone());
        }
        let (next, got) = apply(subject, op);
        let (next_shadow, expected) = apply(shadow, op);
        assert_eq!(got, expected);
        assert_eq!(next.array_type(), next_shadow.array_type());
        assert!(next.iter().eq(next_shadow.iter()));
        if next.is_bespoke() {
            BespokeArray::as_bespoke(next.header()).check_invariants();
        }
        subject = next;
        shadow = next_shadow;
    }
});
