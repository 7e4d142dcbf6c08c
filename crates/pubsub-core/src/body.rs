//! NOTIFY body generation
//!
//! A [`BodyGenerator`] turns event data into a body of one `type/subtype`.
//! Generators are unique per type/subtype and the most recently registered
//! one is found first. [`BodySupplement`]s add to a body after the generator
//! has filled it; any number may be registered for one type/subtype and they
//! run in registration order.
//!
//! Event data is tagged with a body type name so a generator can refuse data
//! it does not understand before trying to downcast it.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::errors::{PubsubError, Result};

/// Event data handed to body generators
#[derive(Clone)]
pub struct BodyData {
    /// Kind of data, matched against [`BodyGenerator::body_type`]
    pub body_type: String,
    pub data: Arc<dyn Any + Send + Sync>,
}

impl BodyData {
    pub fn new<T: Any + Send + Sync>(body_type: impl Into<String>, data: T) -> Self {
        Self {
            body_type: body_type.into(),
            data: Arc::new(data),
        }
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }
}

impl fmt::Debug for BodyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyData")
            .field("body_type", &self.body_type)
            .finish()
    }
}

/// Body under construction, owned by the generator that allocated it
pub type Body = Box<dyn Any + Send>;

pub trait BodyGenerator: Send + Sync {
    /// Media type, e.g. "application"
    fn media_type(&self) -> &str;

    /// Media subtype, e.g. "simple-message-summary"
    fn subtype(&self) -> &str;

    /// Kind of [`BodyData`] this generator accepts
    fn body_type(&self) -> &str;

    fn allocate_body(&self, data: &BodyData) -> Result<Body>;

    fn generate_body_content(&self, body: &mut Body, data: &BodyData) -> Result<()>;

    fn body_to_string(&self, body: &Body) -> Result<String>;
}

impl dyn BodyGenerator {
    /// `type/subtype`
    pub fn content_type(&self) -> String {
        format!("{}/{}", self.media_type(), self.subtype())
    }
}

/// Adds content to bodies of one type/subtype
pub trait BodySupplement: Send + Sync {
    fn media_type(&self) -> &str;

    fn subtype(&self) -> &str;

    fn supplement_body(&self, body: &mut Body, data: &BodyData) -> Result<()>;
}

/// Split `type/subtype[;params]` into trimmed parts
pub fn split_media_type(value: &str) -> Option<(&str, &str)> {
    let essence = value.split(';').next()?.trim();
    let (kind, subtype) = essence.split_once('/')?;
    let (kind, subtype) = (kind.trim(), subtype.trim());
    if kind.is_empty() || subtype.is_empty() {
        return None;
    }
    Some((kind, subtype))
}

fn same_type(a_type: &str, a_subtype: &str, b_type: &str, b_subtype: &str) -> bool {
    a_type.eq_ignore_ascii_case(b_type) && a_subtype.eq_ignore_ascii_case(b_subtype)
}

#[derive(Default)]
pub struct BodyRegistry {
    generators: RwLock<Vec<Arc<dyn BodyGenerator>>>,
    supplements: RwLock<Vec<Arc<dyn BodySupplement>>>,
}

impl BodyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_generator(&self, generator: Arc<dyn BodyGenerator>) -> Result<()> {
        let mut generators = self.generators.write();
        if generators.iter().any(|g| {
            same_type(g.media_type(), g.subtype(), generator.media_type(), generator.subtype())
        }) {
            warn!(
                "A body generator for {} is already registered",
                generator.content_type()
            );
            return Err(PubsubError::DuplicateBodyGenerator(generator.content_type()));
        }
        debug!("Registered body generator for {}", generator.content_type());
        generators.insert(0, generator);
        Ok(())
    }

    pub fn unregister_generator(&self, media_type: &str, subtype: &str) -> bool {
        let mut generators = self.generators.write();
        let before = generators.len();
        generators.retain(|g| !same_type(g.media_type(), g.subtype(), media_type, subtype));
        generators.len() != before
    }

    pub fn find_generator(&self, media_type: &str, subtype: &str) -> Option<Arc<dyn BodyGenerator>> {
        self.generators
            .read()
            .iter()
            .find(|g| same_type(g.media_type(), g.subtype(), media_type, subtype))
            .cloned()
    }

    pub fn is_generator_registered(&self, media_type: &str, subtype: &str) -> bool {
        self.find_generator(media_type, subtype).is_some()
    }

    /// First generator matching one of `accept`, in order, that takes `body_type` data
    pub fn find_for_accept(&self, accept: &[String], body_type: &str) -> Option<Arc<dyn BodyGenerator>> {
        for value in accept {
            let Some((kind, subtype)) = split_media_type(value) else {
                continue;
            };
            match self.find_generator(kind, subtype) {
                Some(generator) if generator.body_type() == body_type => return Some(generator),
                Some(generator) => warn!(
                    "Body generator {} does not accept '{}' data",
                    generator.content_type(),
                    body_type
                ),
                None => debug!("No body generator found for accept type {}", value),
            }
        }
        None
    }

    pub fn register_supplement(&self, supplement: Arc<dyn BodySupplement>) {
        debug!(
            "Registered body supplement for {}/{}",
            supplement.media_type(),
            supplement.subtype()
        );
        self.supplements.write().push(supplement);
    }

    pub fn unregister_supplement(&self, supplement: &Arc<dyn BodySupplement>) -> bool {
        let mut supplements = self.supplements.write();
        let before = supplements.len();
        supplements.retain(|s| !std::ptr::addr_eq(Arc::as_ptr(s), Arc::as_ptr(supplement)));
        supplements.len() != before
    }

    /// Build a body of `type/subtype` from `data`, running every matching supplement
    pub fn generate_body_content(&self, media_type: &str, subtype: &str, data: &BodyData) -> Result<String> {
        let generator = self.find_generator(media_type, subtype).ok_or_else(|| {
            warn!("Unable to find a body generator for {}/{}", media_type, subtype);
            PubsubError::NoBodyGenerator(format!("{}/{}", media_type, subtype))
        })?;
        if generator.body_type() != data.body_type {
            return Err(PubsubError::BodyTypeMismatch {
                generator: generator.content_type(),
                body_type: data.body_type.clone(),
            });
        }

        let mut body = generator.allocate_body(data)?;
        generator.generate_body_content(&mut body, data)?;

        let supplements: Vec<Arc<dyn BodySupplement>> = self
            .supplements
            .read()
            .iter()
            .filter(|s| same_type(s.media_type(), s.subtype(), generator.media_type(), generator.subtype()))
            .cloned()
            .collect();
        for supplement in supplements {
            supplement.supplement_body(&mut body, data)?;
        }

        generator.body_to_string(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain {
        subtype: &'static str,
    }

    impl BodyGenerator for Plain {
        fn media_type(&self) -> &str {
            "text"
        }

        fn subtype(&self) -> &str {
            self.subtype
        }

        fn body_type(&self) -> &str {
            "words"
        }

        fn allocate_body(&self, _data: &BodyData) -> Result<Body> {
            Ok(Box::new(Vec::<String>::new()))
        }

        fn generate_body_content(&self, body: &mut Body, data: &BodyData) -> Result<()> {
            let lines = body
                .downcast_mut::<Vec<String>>()
                .ok_or_else(|| PubsubError::body("wrong body"))?;
            let word = data.get::<&str>().ok_or_else(|| PubsubError::body("wrong data"))?;
            lines.push(word.to_string());
            Ok(())
        }

        fn body_to_string(&self, body: &Body) -> Result<String> {
            let lines = body
                .downcast_ref::<Vec<String>>()
                .ok_or_else(|| PubsubError::body("wrong body"))?;
            Ok(lines.join("\n"))
        }
    }

    struct Signature(&'static str);

    impl BodySupplement for Signature {
        fn media_type(&self) -> &str {
            "text"
        }

        fn subtype(&self) -> &str {
            "plain"
        }

        fn supplement_body(&self, body: &mut Body, _data: &BodyData) -> Result<()> {
            if let Some(lines) = body.downcast_mut::<Vec<String>>() {
                lines.push(self.0.to_string());
            }
            Ok(())
        }
    }

    #[test]
    fn duplicate_generator_is_refused() {
        let registry = BodyRegistry::new();
        registry.register_generator(Arc::new(Plain { subtype: "plain" })).unwrap();
        let err = registry
            .register_generator(Arc::new(Plain { subtype: "PLAIN" }))
            .unwrap_err();
        assert!(matches!(err, PubsubError::DuplicateBodyGenerator(t) if t == "text/PLAIN"));
        assert!(registry.unregister_generator("text", "plain"));
        assert!(!registry.is_generator_registered("text", "plain"));
    }

    #[test]
    fn supplements_run_in_registration_order() {
        let registry = BodyRegistry::new();
        registry.register_generator(Arc::new(Plain { subtype: "plain" })).unwrap();
        registry.register_supplement(Arc::new(Signature("one")));
        let second: Arc<dyn BodySupplement> = Arc::new(Signature("two"));
        registry.register_supplement(second.clone());

        let data = BodyData::new("words", "hello");
        let body = registry.generate_body_content("text", "plain", &data).unwrap();
        assert_eq!(body, "hello\none\ntwo");

        assert!(registry.unregister_supplement(&second));
        let body = registry.generate_body_content("text", "plain", &data).unwrap();
        assert_eq!(body, "hello\none");
    }

    #[test]
    fn mismatched_data_is_refused() {
        let registry = BodyRegistry::new();
        registry.register_generator(Arc::new(Plain { subtype: "plain" })).unwrap();
        let data = BodyData::new("presence", 1u32);
        assert!(matches!(
            registry.generate_body_content("text", "plain", &data),
            Err(PubsubError::BodyTypeMismatch { .. })
        ));
        assert!(matches!(
            registry.generate_body_content("text", "html", &data),
            Err(PubsubError::NoBodyGenerator(_))
        ));
    }

    #[test]
    fn accept_list_is_searched_in_order() {
        let registry = BodyRegistry::new();
        registry.register_generator(Arc::new(Plain { subtype: "plain" })).unwrap();
        let accept = vec![
            "application/pidf+xml".to_string(),
            "text/plain;charset=utf-8".to_string(),
        ];
        let found = registry.find_for_accept(&accept, "words").unwrap();
        assert_eq!(found.content_type(), "text/plain");
        assert!(registry.find_for_accept(&accept, "presence").is_none());
    }
}
