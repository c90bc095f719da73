//! The composed supergraph: every type and field of every subgraph, annotated
//! with which subgraphs can resolve it.

use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::fmt::{self, Write};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubgraphEndpoint {
    pub name: String,
    pub url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Object,
    Interface,
    Union,
    Enum,
    Scalar,
    InputObject,
}

impl TypeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeKind::Object => "object",
            TypeKind::Interface => "interface",
            TypeKind::Union => "union",
            TypeKind::Enum => "enum",
            TypeKind::Scalar => "scalar",
            TypeKind::InputObject => "input object",
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            TypeKind::Object => "type",
            TypeKind::Interface => "interface",
            TypeKind::Union => "union",
            TypeKind::Enum => "enum",
            TypeKind::Scalar => "scalar",
            TypeKind::InputObject => "input",
        }
    }
}

/// A field or argument type, e.g. `[Customer!]!`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeRef {
    Named(String),
    List(Box<TypeRef>),
    NonNull(Box<TypeRef>),
}

impl TypeRef {
    pub fn named_type(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::List(inner) | TypeRef::NonNull(inner) => inner.named_type(),
        }
    }

    /// Number of list wrappers between the field and its named type.
    pub fn list_depth(&self) -> usize {
        match self {
            TypeRef::Named(_) => 0,
            TypeRef::List(inner) => 1 + inner.list_depth(),
            TypeRef::NonNull(inner) => inner.list_depth(),
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }
}

impl<'a> From<&graphql_parser::schema::Type<'a, String>> for TypeRef {
    fn from(ty: &graphql_parser::schema::Type<'a, String>) -> Self {
        use graphql_parser::schema::Type;
        match ty {
            Type::NamedType(name) => TypeRef::Named(name.clone()),
            Type::ListType(inner) => TypeRef::List(Box::new(inner.as_ref().into())),
            Type::NonNullType(inner) => TypeRef::NonNull(Box::new(inner.as_ref().into())),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::List(inner) => write!(f, "[{inner}]"),
            TypeRef::NonNull(inner) => write!(f, "{inner}!"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgumentDefinition {
    pub name: String,
    pub ty: TypeRef,
    pub default_value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    pub ty: TypeRef,
    pub arguments: Vec<ArgumentDefinition>,
    /// Subgraphs able to resolve the field, in registration order.
    pub resolvers: Vec<String>,
    /// Subgraphs that only reference the field through `@external`.
    pub external_in: Vec<String>,
    pub shareable: bool,
}

/// A `@key` declared by one subgraph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityKey {
    pub subgraph: String,
    pub fields: Vec<String>,
    pub resolvable: bool,
}

impl EntityKey {
    pub fn selection(&self) -> String {
        self.fields.join(" ")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeDefinition {
    pub name: String,
    pub kind: TypeKind,
    /// Subgraphs declaring the type, in registration order.
    pub subgraphs: Vec<String>,
    pub keys: Vec<EntityKey>,
    pub fields: IndexMap<String, FieldDefinition>,
    pub implements: Vec<String>,
    /// Union members, or the object types implementing an interface.
    pub possible_types: Vec<String>,
    pub enum_values: Vec<String>,
    pub input_fields: Vec<ArgumentDefinition>,
}

impl TypeDefinition {
    pub(crate) fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        TypeDefinition {
            name: name.into(),
            kind,
            subgraphs: Vec::new(),
            keys: Vec::new(),
            fields: IndexMap::new(),
            implements: Vec::new(),
            possible_types: Vec::new(),
            enum_values: Vec::new(),
            input_fields: Vec::new(),
        }
    }

    pub fn is_entity(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn is_composite(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Object | TypeKind::Interface | TypeKind::Union
        )
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self.kind, TypeKind::Interface | TypeKind::Union)
    }

    /// Keys through which `subgraph` accepts representations of this type.
    pub fn resolvable_keys<'a>(&'a self, subgraph: &'a str) -> impl Iterator<Item = &'a EntityKey> {
        self.keys
            .iter()
            .filter(move |key| key.subgraph == subgraph && key.resolvable)
    }

    pub fn is_key_field(&self, field: &str) -> bool {
        self.keys
            .iter()
            .any(|key| key.fields.iter().any(|f| f == field))
    }
}

/// Result of composition. Read-only once built, shared across requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupergraphSchema {
    pub subgraphs: Vec<SubgraphEndpoint>,
    pub query_type: String,
    pub mutation_type: Option<String>,
    pub types: BTreeMap<String, TypeDefinition>,
}

impl SupergraphSchema {
    pub fn get_type(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.get(name)
    }

    pub fn field(&self, type_name: &str, field: &str) -> Option<&FieldDefinition> {
        self.types.get(type_name)?.fields.get(field)
    }

    /// Whether `subgraph` can return `type_name.field`: it resolves the
    /// field, or the field is part of a key `subgraph` declares for the type,
    /// which lets it return references to entities it does not own.
    pub fn can_resolve(&self, type_name: &str, field: &str, subgraph: &str) -> bool {
        let Some(ty) = self.types.get(type_name) else {
            return false;
        };
        let resolves = ty
            .fields
            .get(field)
            .is_some_and(|definition| definition.resolvers.iter().any(|s| s == subgraph));
        resolves
            || ty
                .keys
                .iter()
                .any(|key| key.subgraph == subgraph && key.fields.iter().any(|f| f == field))
    }

    pub fn subgraph_url(&self, name: &str) -> Option<&str> {
        self.subgraphs
            .iter()
            .find(|subgraph| subgraph.name == name)
            .map(|subgraph| subgraph.url.as_str())
    }

    pub fn is_composite(&self, type_name: &str) -> bool {
        self.types
            .get(type_name)
            .is_some_and(TypeDefinition::is_composite)
    }

    pub fn is_abstract(&self, type_name: &str) -> bool {
        self.types
            .get(type_name)
            .is_some_and(TypeDefinition::is_abstract)
    }

    /// Whether an object of type `runtime_type` matches the type condition.
    pub fn type_condition_matches(&self, condition: &str, runtime_type: &str) -> bool {
        condition == runtime_type
            || self
                .types
                .get(condition)
                .is_some_and(|ty| ty.possible_types.iter().any(|t| t == runtime_type))
    }

    /// Prints the supergraph as SDL with join annotations.
    ///
    /// The output only depends on the composed content, so composing the
    /// same subgraphs twice yields byte-identical text.
    pub fn to_sdl(&self) -> String {
        let mut sdl = String::new();
        let _ = self.write_sdl(&mut sdl);
        sdl
    }

    fn write_sdl(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "schema {{")?;
        writeln!(out, "  query: {}", self.query_type)?;
        if let Some(mutation) = &self.mutation_type {
            writeln!(out, "  mutation: {mutation}")?;
        }
        writeln!(out, "}}")?;

        writeln!(out, "\nenum join__Graph {{")?;
        for subgraph in &self.subgraphs {
            writeln!(
                out,
                "  {} @join__graph(name: {:?}, url: {:?})",
                graph_enum_value(&subgraph.name),
                subgraph.name,
                subgraph.url
            )?;
        }
        writeln!(out, "}}")?;

        for ty in self.types.values() {
            writeln!(out)?;
            write!(out, "{} {}", ty.kind.keyword(), ty.name)?;
            if !ty.implements.is_empty() {
                write!(out, " implements {}", ty.implements.join(" & "))?;
            }
            for subgraph in &ty.subgraphs {
                write!(out, " @join__type(graph: {}", graph_enum_value(subgraph))?;
                for key in ty.keys.iter().filter(|key| &key.subgraph == subgraph) {
                    write!(out, ", key: {:?}", key.selection())?;
                    if !key.resolvable {
                        write!(out, ", resolvable: false")?;
                    }
                }
                write!(out, ")")?;
            }

            match ty.kind {
                TypeKind::Scalar => writeln!(out)?,
                TypeKind::Union => writeln!(out, " = {}", ty.possible_types.join(" | "))?,
                TypeKind::Enum => {
                    writeln!(out, " {{")?;
                    for value in &ty.enum_values {
                        writeln!(out, "  {value}")?;
                    }
                    writeln!(out, "}}")?;
                }
                TypeKind::InputObject => {
                    writeln!(out, " {{")?;
                    for field in &ty.input_fields {
                        write!(out, "  {}: {}", field.name, field.ty)?;
                        if let Some(default) = &field.default_value {
                            write!(out, " = {default}")?;
                        }
                        writeln!(out)?;
                    }
                    writeln!(out, "}}")?;
                }
                TypeKind::Object | TypeKind::Interface => {
                    writeln!(out, " {{")?;
                    for field in ty.fields.values() {
                        write!(out, "  {}", field.name)?;
                        if !field.arguments.is_empty() {
                            let arguments = field
                                .arguments
                                .iter()
                                .map(|arg| match &arg.default_value {
                                    Some(default) => format!("{}: {} = {}", arg.name, arg.ty, default),
                                    None => format!("{}: {}", arg.name, arg.ty),
                                })
                                .collect::<Vec<_>>();
                            write!(out, "({})", arguments.join(", "))?;
                        }
                        write!(out, ": {}", field.ty)?;
                        for subgraph in &field.resolvers {
                            write!(out, " @join__field(graph: {})", graph_enum_value(subgraph))?;
                        }
                        for subgraph in &field.external_in {
                            write!(
                                out,
                                " @join__field(graph: {}, external: true)",
                                graph_enum_value(subgraph)
                            )?;
                        }
                        writeln!(out)?;
                    }
                    writeln!(out, "}}")?;
                }
            }
        }
        Ok(())
    }
}

fn graph_enum_value(subgraph: &str) -> String {
    subgraph.to_ascii_uppercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn type_ref_prints_like_sdl() {
        let ty = TypeRef::NonNull(Box::new(TypeRef::List(Box::new(TypeRef::NonNull(
            Box::new(TypeRef::Named("Customer".to_string())),
        )))));

        assert_eq!(ty.to_string(), "[Customer!]!");
        assert_eq!(ty.named_type(), "Customer");
        assert_eq!(ty.list_depth(), 1);
        assert!(ty.is_non_null());
    }

    #[test]
    fn type_condition_matches_union_members() {
        let mut union = TypeDefinition::new("Resident", TypeKind::Union);
        union.possible_types = vec!["Customer".to_string(), "Manager".to_string()];
        let schema = SupergraphSchema {
            subgraphs: vec![],
            query_type: "Query".to_string(),
            mutation_type: None,
            types: BTreeMap::from([("Resident".to_string(), union)]),
        };

        assert!(schema.type_condition_matches("Resident", "Manager"));
        assert!(schema.type_condition_matches("Room", "Room"));
        assert!(!schema.type_condition_matches("Resident", "Room"));
    }
}
