//! A trivial resource used to exercise the resource machinery in tests.
//!
//! The payload is the ASCII decimal of a positive float `v`. `get(x)`
//! returns `x / v`; `err(x)` always fails at call time.

use crate::error::ResourceError;
use crate::layout::Layout;
use crate::resource::{MethodDecl, ResourceImpl};

const GET: usize = 0;
const ERR: usize = 1;

pub(crate) struct Dummy {
    name: String,
    value: f64,
}

impl Dummy {
    pub fn load(name: &str, payload: &[u8]) -> Result<Self, ResourceError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| ResourceError::new(name, "payload is not UTF-8"))?;
        let value: f64 = text
            .trim()
            .parse()
            .map_err(|_| ResourceError::new(name, format!("payload `{text}` is not a number")))?;
        if value <= 0.0 {
            return Err(ResourceError::new(
                name,
                format!("dummy resource requires a positive number, got {value}"),
            ));
        }
        Ok(Dummy {
            name: name.to_string(),
            value,
        })
    }
}

impl ResourceImpl for Dummy {
    fn methods(&self) -> Vec<MethodDecl> {
        let scalar_in = Layout::struct_of([("x", Layout::Scalar)]);
        vec![
            MethodDecl {
                name: "get".into(),
                input_layout: scalar_in.clone(),
                output_layout: Layout::Scalar,
                reentrant: true,
            },
            MethodDecl {
                name: "err".into(),
                input_layout: scalar_in,
                output_layout: Layout::Scalar,
                reentrant: true,
            },
        ]
    }

    fn call(&self, method: usize, input: &[u64], output: &mut [u64]) -> Result<(), ResourceError> {
        match method {
            GET => {
                let x = f64::from_bits(input[0]);
                output[0] = (x / self.value).to_bits();
                Ok(())
            }
            ERR => Err(ResourceError::new(&self.name, "err method always fails")),
            _ => Err(ResourceError::new(
                &self.name,
                format!("no method with index {method}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_validates_the_payload() {
        assert!(Dummy::load("r", b"2.5").is_ok());
        assert!(Dummy::load("r", b"0.0").is_err());
        assert!(Dummy::load("r", b"-1").is_err());
        assert!(Dummy::load("r", b"spam").is_err());
    }

    #[test]
    fn get_divides_by_the_payload() {
        let dummy = Dummy::load("r", b"2.5").unwrap();
        let mut out = [0u64];
        dummy.call(GET, &[2.5f64.to_bits()], &mut out).unwrap();
        assert_eq!(f64::from_bits(out[0]), 1.0);
        assert!(dummy.call(ERR, &[0u64], &mut out).is_err());
    }
}
