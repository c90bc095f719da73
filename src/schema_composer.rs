//! Composition of subgraph schemas into a [`SupergraphSchema`].
//!
//! Composition is a pure function of the registered subgraphs: every type is
//! unioned across subgraphs, entity fields are merged with per-field
//! ownership, and every conflict found along the way is reported together.

use graphql_parser::parse_schema;
use graphql_parser::schema::{
    Definition, Directive, Document, Field, InputValue, TypeDefinition as SdlType, TypeExtension,
    Value,
};
use std::collections::{BTreeMap, HashSet};

use crate::supergraph::{
    ArgumentDefinition, EntityKey, FieldDefinition, SubgraphEndpoint, SupergraphSchema,
    TypeDefinition, TypeKind, TypeRef,
};
use crate::{CompositionConflict, CompositionError, Subgraph};

/// Federation plumbing that subgraphs expose but clients never see.
const FEDERATION_TYPES: &[&str] = &[
    "_Any",
    "_Entity",
    "_FieldSet",
    "_Service",
    "FieldSet",
    "federation__FieldSet",
    "federation__Policy",
    "federation__Scope",
    "link__Import",
    "link__Purpose",
];
const FEDERATION_ROOT_FIELDS: &[&str] = &["_entities", "_service"];

pub fn compose(subgraphs: &[Subgraph]) -> Result<SupergraphSchema, CompositionError> {
    let mut composer = Composer::default();
    for subgraph in subgraphs {
        composer.add_subgraph(subgraph);
    }
    composer.finish(subgraphs)
}

struct RootNames {
    query: String,
    mutation: String,
    subscription: String,
}

impl RootNames {
    fn from_document(document: &Document<'_, String>) -> Self {
        let mut roots = RootNames {
            query: "Query".to_string(),
            mutation: "Mutation".to_string(),
            subscription: "Subscription".to_string(),
        };
        for definition in &document.definitions {
            if let Definition::SchemaDefinition(schema) = definition {
                if let Some(query) = &schema.query {
                    roots.query = query.clone();
                }
                if let Some(mutation) = &schema.mutation {
                    roots.mutation = mutation.clone();
                }
                if let Some(subscription) = &schema.subscription {
                    roots.subscription = subscription.clone();
                }
            }
        }
        roots
    }

    /// Maps a subgraph type name to its supergraph name, `None` for types
    /// the gateway does not expose.
    fn normalize<'n>(&'n self, name: &'n str) -> Option<&'n str> {
        if FEDERATION_TYPES.contains(&name) || name == self.subscription {
            None
        } else if name == self.query {
            Some("Query")
        } else if name == self.mutation {
            Some("Mutation")
        } else {
            Some(name)
        }
    }
}

/// An object or interface type, whether defined or extended.
struct ObjectLike<'d, 'a> {
    name: &'d str,
    kind: TypeKind,
    implements: &'d [String],
    directives: &'d [Directive<'a, String>],
    fields: &'d [Field<'a, String>],
    extension: bool,
}

#[derive(Default)]
struct Composer {
    types: BTreeMap<String, TypeDefinition>,
    /// (type, subgraph, field) for every field a subgraph declares, external or not.
    declared: HashSet<(String, String, String)>,
    /// (type, subgraph) for every type a subgraph extends.
    extensions: Vec<(String, String)>,
    /// Subgraph that first defined each enum or input object.
    first_definition: BTreeMap<String, String>,
    conflicts: Vec<CompositionConflict>,
}

impl Composer {
    fn add_subgraph(&mut self, subgraph: &Subgraph) {
        let document = match parse_schema::<String>(subgraph.schema()) {
            Ok(document) => document,
            Err(e) => {
                self.conflicts.push(CompositionConflict::InvalidSchema {
                    subgraph: subgraph.name().to_string(),
                    message: e.to_string(),
                });
                return;
            }
        };
        let roots = RootNames::from_document(&document);
        let name = subgraph.name();

        for definition in &document.definitions {
            match definition {
                Definition::TypeDefinition(SdlType::Object(object)) => {
                    if object.name == roots.subscription {
                        tracing::warn!(subgraph = name, "ignoring subscription root type");
                    }
                    let Some(type_name) = roots.normalize(&object.name) else {
                        continue;
                    };
                    self.add_object_like(
                        name,
                        type_name,
                        ObjectLike {
                            name: &object.name,
                            kind: TypeKind::Object,
                            implements: &object.implements_interfaces,
                            directives: &object.directives,
                            fields: &object.fields,
                            extension: false,
                        },
                    );
                }
                Definition::TypeExtension(TypeExtension::Object(object)) => {
                    let Some(type_name) = roots.normalize(&object.name) else {
                        continue;
                    };
                    self.add_object_like(
                        name,
                        type_name,
                        ObjectLike {
                            name: &object.name,
                            kind: TypeKind::Object,
                            implements: &object.implements_interfaces,
                            directives: &object.directives,
                            fields: &object.fields,
                            extension: true,
                        },
                    );
                }
                Definition::TypeDefinition(SdlType::Interface(interface)) => {
                    self.add_object_like(
                        name,
                        &interface.name,
                        ObjectLike {
                            name: &interface.name,
                            kind: TypeKind::Interface,
                            implements: &interface.implements_interfaces,
                            directives: &interface.directives,
                            fields: &interface.fields,
                            extension: false,
                        },
                    );
                }
                Definition::TypeExtension(TypeExtension::Interface(interface)) => {
                    self.add_object_like(
                        name,
                        &interface.name,
                        ObjectLike {
                            name: &interface.name,
                            kind: TypeKind::Interface,
                            implements: &interface.implements_interfaces,
                            directives: &interface.directives,
                            fields: &interface.fields,
                            extension: true,
                        },
                    );
                }
                Definition::TypeDefinition(SdlType::Union(union)) => {
                    self.add_union(name, &union.name, &union.types);
                }
                Definition::TypeExtension(TypeExtension::Union(union)) => {
                    self.add_union(name, &union.name, &union.types);
                }
                Definition::TypeDefinition(SdlType::Enum(enumeration)) => {
                    let values: Vec<String> =
                        enumeration.values.iter().map(|v| v.name.clone()).collect();
                    self.add_enum(name, &enumeration.name, values, false);
                }
                Definition::TypeExtension(TypeExtension::Enum(enumeration)) => {
                    let values: Vec<String> =
                        enumeration.values.iter().map(|v| v.name.clone()).collect();
                    self.add_enum(name, &enumeration.name, values, true);
                }
                Definition::TypeDefinition(SdlType::Scalar(scalar)) => {
                    if !FEDERATION_TYPES.contains(&scalar.name.as_str()) {
                        self.type_entry(name, &scalar.name, TypeKind::Scalar);
                    }
                }
                Definition::TypeDefinition(SdlType::InputObject(input)) => {
                    self.add_input(name, &input.name, &input.fields, false);
                }
                Definition::TypeExtension(TypeExtension::InputObject(input)) => {
                    self.add_input(name, &input.name, &input.fields, true);
                }
                Definition::TypeExtension(TypeExtension::Scalar(_))
                | Definition::SchemaDefinition(_)
                | Definition::DirectiveDefinition(_) => {}
            }
        }
    }

    /// Returns the supergraph entry for a type, recording `subgraph` as one
    /// of its declaring subgraphs. `None` when the kind clashes.
    fn type_entry(
        &mut self,
        subgraph: &str,
        type_name: &str,
        kind: TypeKind,
    ) -> Option<&mut TypeDefinition> {
        let ty = self
            .types
            .entry(type_name.to_string())
            .or_insert_with(|| TypeDefinition::new(type_name, kind));

        if ty.kind != kind {
            self.conflicts.push(CompositionConflict::TypeKindMismatch {
                type_name: type_name.to_string(),
                first: ty.kind.as_str(),
                first_subgraph: ty.subgraphs.first().cloned().unwrap_or_default(),
                second: kind.as_str(),
                second_subgraph: subgraph.to_string(),
            });
            return None;
        }
        if !ty.subgraphs.iter().any(|s| s == subgraph) {
            ty.subgraphs.push(subgraph.to_string());
        }
        Some(ty)
    }

    fn add_object_like(&mut self, subgraph: &str, type_name: &str, object: ObjectLike<'_, '_>) {
        let is_root = type_name == "Query" || type_name == "Mutation";
        let extension = object.extension || has_directive(object.directives, "extends");
        let type_shareable = has_directive(object.directives, "shareable");

        let mut keys = Vec::new();
        for directive in object.directives.iter().filter(|d| d.name == "key") {
            let Some(fields) = string_argument(directive, "fields") else {
                continue;
            };
            if fields.contains('{') {
                self.conflicts.push(CompositionConflict::NestedKey {
                    type_name: type_name.to_string(),
                    subgraph: subgraph.to_string(),
                    fields,
                });
                continue;
            }
            keys.push(EntityKey {
                subgraph: subgraph.to_string(),
                fields: fields.split_whitespace().map(str::to_string).collect(),
                resolvable: bool_argument(directive, "resolvable").unwrap_or(true),
            });
        }

        if extension {
            self.extensions
                .push((type_name.to_string(), subgraph.to_string()));
        }
        for field in object.fields {
            if field.name.starts_with("__")
                || (is_root && FEDERATION_ROOT_FIELDS.contains(&field.name.as_str()))
            {
                continue;
            }
            self.declared.insert((
                type_name.to_string(),
                subgraph.to_string(),
                field.name.clone(),
            ));
        }

        let mut conflicts = Vec::new();
        let Some(ty) = self.type_entry(subgraph, type_name, object.kind) else {
            return;
        };
        ty.keys.extend(keys);
        for interface in object.implements {
            if !ty.implements.contains(interface) {
                ty.implements.push(interface.clone());
            }
        }

        for field in object.fields {
            if field.name.starts_with("__")
                || (is_root && FEDERATION_ROOT_FIELDS.contains(&field.name.as_str()))
            {
                continue;
            }
            let field_type = TypeRef::from(&field.field_type);
            let external = has_directive(&field.directives, "external");
            let shareable = type_shareable || has_directive(&field.directives, "shareable");

            let definition = ty
                .fields
                .entry(field.name.clone())
                .or_insert_with(|| FieldDefinition {
                    name: field.name.clone(),
                    ty: field_type.clone(),
                    arguments: field.arguments.iter().map(argument_definition).collect(),
                    resolvers: Vec::new(),
                    external_in: Vec::new(),
                    shareable: false,
                });

            if definition.ty != field_type {
                conflicts.push(CompositionConflict::FieldTypeMismatch {
                    type_name: type_name.to_string(),
                    field: field.name.clone(),
                    expected: definition.ty.to_string(),
                    subgraph: subgraph.to_string(),
                    found: field_type.to_string(),
                });
            }

            if external {
                definition.external_in.push(subgraph.to_string());
            } else {
                definition.shareable = if definition.resolvers.is_empty() {
                    shareable
                } else {
                    definition.shareable && shareable
                };
                definition.resolvers.push(subgraph.to_string());
            }
        }
        tracing::trace!(subgraph, type_name = object.name, "merged type");
        self.conflicts.extend(conflicts);
    }

    fn add_union(&mut self, subgraph: &str, type_name: &str, members: &[String]) {
        if let Some(ty) = self.type_entry(subgraph, type_name, TypeKind::Union) {
            for member in members {
                if !ty.possible_types.contains(member) {
                    ty.possible_types.push(member.clone());
                }
            }
        }
    }

    fn add_enum(&mut self, subgraph: &str, type_name: &str, values: Vec<String>, extension: bool) {
        let first = self
            .first_definition
            .get(type_name)
            .cloned()
            .unwrap_or_else(|| subgraph.to_string());
        let mut mismatch = None;
        if let Some(ty) = self.type_entry(subgraph, type_name, TypeKind::Enum) {
            if extension || ty.enum_values.is_empty() {
                for value in values {
                    if !ty.enum_values.contains(&value) {
                        ty.enum_values.push(value);
                    }
                }
            } else if !same_members(&ty.enum_values, &values) {
                mismatch = Some(CompositionConflict::DefinitionMismatch {
                    type_name: type_name.to_string(),
                    first_subgraph: first.clone(),
                    second_subgraph: subgraph.to_string(),
                });
            }
        }
        self.first_definition
            .entry(type_name.to_string())
            .or_insert(first);
        self.conflicts.extend(mismatch);
    }

    fn add_input(
        &mut self,
        subgraph: &str,
        type_name: &str,
        fields: &[InputValue<'_, String>],
        extension: bool,
    ) {
        let first = self
            .first_definition
            .get(type_name)
            .cloned()
            .unwrap_or_else(|| subgraph.to_string());
        let fields: Vec<ArgumentDefinition> = fields.iter().map(argument_definition).collect();
        let mut mismatch = None;
        if let Some(ty) = self.type_entry(subgraph, type_name, TypeKind::InputObject) {
            if extension || ty.input_fields.is_empty() {
                for field in fields {
                    if !ty.input_fields.iter().any(|f| f.name == field.name) {
                        ty.input_fields.push(field);
                    }
                }
            } else if !same_members(&ty.input_fields, &fields) {
                mismatch = Some(CompositionConflict::DefinitionMismatch {
                    type_name: type_name.to_string(),
                    first_subgraph: first.clone(),
                    second_subgraph: subgraph.to_string(),
                });
            }
        }
        self.first_definition
            .entry(type_name.to_string())
            .or_insert(first);
        self.conflicts.extend(mismatch);
    }

    fn finish(mut self, subgraphs: &[Subgraph]) -> Result<SupergraphSchema, CompositionError> {
        if !self.types.contains_key("Query") {
            self.conflicts.push(CompositionConflict::NoQueryType);
        }

        let implementations: Vec<(String, String)> = self
            .types
            .values()
            .filter(|ty| ty.kind == TypeKind::Object)
            .flat_map(|ty| {
                ty.implements
                    .iter()
                    .map(|interface| (interface.clone(), ty.name.clone()))
            })
            .collect();
        for (interface, object) in implementations {
            if let Some(ty) = self.types.get_mut(&interface) {
                if !ty.possible_types.contains(&object) {
                    ty.possible_types.push(object);
                }
            }
        }

        for ty in self.types.values().filter(|ty| !ty.fields.is_empty()) {
            for field in ty.fields.values() {
                if field.resolvers.is_empty() {
                    self.conflicts.push(CompositionConflict::UnresolvableField {
                        type_name: ty.name.clone(),
                        field: field.name.clone(),
                    });
                } else if field.resolvers.len() > 1
                    && !field.shareable
                    && !(ty.is_entity() && ty.is_key_field(&field.name))
                {
                    self.conflicts.push(CompositionConflict::FieldOwnership {
                        type_name: ty.name.clone(),
                        field: field.name.clone(),
                        subgraphs: field.resolvers.clone(),
                    });
                }
            }

            for key in &ty.keys {
                for field in &key.fields {
                    let declared =
                        (ty.name.clone(), key.subgraph.clone(), field.clone());
                    if !self.declared.contains(&declared) {
                        self.conflicts.push(CompositionConflict::MissingKeyField {
                            type_name: ty.name.clone(),
                            subgraph: key.subgraph.clone(),
                            field: field.clone(),
                        });
                    }
                }
            }
        }

        for (type_name, subgraph) in &self.extensions {
            let Some(ty) = self.types.get(type_name) else {
                continue;
            };
            if ty.is_entity() && !ty.keys.iter().any(|key| &key.subgraph == subgraph) {
                self.conflicts.push(CompositionConflict::MissingKey {
                    type_name: type_name.clone(),
                    subgraph: subgraph.clone(),
                });
            }
        }

        if !self.conflicts.is_empty() {
            return Err(CompositionError {
                conflicts: self.conflicts,
            });
        }

        let mutation_type = self
            .types
            .contains_key("Mutation")
            .then(|| "Mutation".to_string());
        Ok(SupergraphSchema {
            subgraphs: subgraphs
                .iter()
                .map(|subgraph| SubgraphEndpoint {
                    name: subgraph.name().to_string(),
                    url: subgraph.url().to_string(),
                })
                .collect(),
            query_type: "Query".to_string(),
            mutation_type,
            types: self.types,
        })
    }
}

fn has_directive(directives: &[Directive<'_, String>], name: &str) -> bool {
    directives.iter().any(|d| d.name == name)
}

fn string_argument(directive: &Directive<'_, String>, name: &str) -> Option<String> {
    directive
        .arguments
        .iter()
        .find(|(arg, _)| arg == name)
        .and_then(|(_, value)| match value {
            Value::String(s) => Some(s.clone()),
            _ => None,
        })
}

fn bool_argument(directive: &Directive<'_, String>, name: &str) -> Option<bool> {
    directive
        .arguments
        .iter()
        .find(|(arg, _)| arg == name)
        .and_then(|(_, value)| match value {
            Value::Boolean(b) => Some(*b),
            _ => None,
        })
}

fn argument_definition(input: &InputValue<'_, String>) -> ArgumentDefinition {
    ArgumentDefinition {
        name: input.name.clone(),
        ty: TypeRef::from(&input.value_type),
        default_value: input.default_value.as_ref().map(|v| v.to_string()),
    }
}

fn same_members<T: PartialEq>(left: &[T], right: &[T]) -> bool {
    left.len() == right.len() && left.iter().all(|item| right.contains(item))
}
