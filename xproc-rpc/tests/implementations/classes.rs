use std::sync::atomic::{AtomicI64, Ordering};

use bson::Bson;
use xproc_rpc::{reply, Args, MethodError, RpcClass};

pub struct Echo;

impl RpcClass for Echo {
    const CLASS_NAME: &'static str = "Echo";

    fn construct(_args: Args) -> Result<Self, String> {
        Ok(Echo)
    }

    fn dispatch(&self, method: &str, args: Args) -> Result<Bson, MethodError> {
        match method {
            "reflect" => reply(&args.get::<i64>(0)?),
            "greet" => {
                let name: String = args.get(0)?;
                let punctuation = args
                    .kw::<String>("punctuation")?
                    .unwrap_or_else(|| "!".into());

                reply(&format!("Hello, {name}{punctuation}"))
            }
            _ => Err(MethodError::NotFound),
        }
    }
}

pub struct Faulty;

impl RpcClass for Faulty {
    const CLASS_NAME: &'static str = "Faulty";

    fn construct(args: Args) -> Result<Self, String> {
        if args.kw::<bool>("refuse").ok().flatten() == Some(true) {
            return Err("refused to construct".into());
        }

        Ok(Faulty)
    }

    fn dispatch(&self, method: &str, _args: Args) -> Result<Bson, MethodError> {
        match method {
            "boom" => Err(MethodError::failed("boom")),
            "panic" => panic!("kaboom"),
            _ => Err(MethodError::NotFound),
        }
    }
}

pub struct Counter {
    value: AtomicI64,
}

impl RpcClass for Counter {
    const CLASS_NAME: &'static str = "Counter";

    fn construct(args: Args) -> Result<Self, String> {
        let start = args.get::<i64>(0).unwrap_or(0);

        Ok(Counter {
            value: AtomicI64::new(start),
        })
    }

    fn dispatch(&self, method: &str, _args: Args) -> Result<Bson, MethodError> {
        match method {
            "increment" => reply(&(self.value.fetch_add(1, Ordering::SeqCst) + 1)),
            "get" => reply(&self.value.load(Ordering::SeqCst)),
            _ => Err(MethodError::NotFound),
        }
    }
}
