/// Type system for the Pascal compiler.
///
/// All type entities live in a `TypeArena` and are referred to by
/// stable `TypeId` indices. The arena owns the (cyclic) type graph:
/// forward-declared pointers carry a pending name that is patched
/// in a post-pass after each `type` block, so ownership never has to
/// be acyclic.
///
/// Layout is computed here, not by the backend: Cranelift only has
/// scalar types, so compound types are described by (size, align)
/// plus field/element offsets, and scalars map to a `Scalar` kind the
/// code generator translates to a backend type.
use std::fmt;

// ═══════════════════════════════════════════════════════════════
// Set layout constants
// ═══════════════════════════════════════════════════════════════

/// Bits per set word. Sets are bitmaps of 32-bit words: element `e`
/// occupies bit `e & SET_MASK` of word `e >> SET_POW2_BITS`.
pub const SET_BITS: u32 = 32;
pub const SET_POW2_BITS: u32 = 5;
pub const SET_MASK: u32 = SET_BITS - 1;
/// Upper limit on the number of elements in a set type.
pub const MAX_SET_SIZE: i64 = 0x8000;

/// Maximum declarable `string[N]` capacity; the length prefix is a
/// single byte.
pub const MAX_STRING_CAPACITY: i64 = 255;

// ═══════════════════════════════════════════════════════════════
// Type entities
// ═══════════════════════════════════════════════════════════════

/// Stable identifier of a type entity inside a `TypeArena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Scalar classification used by the code generator to pick a
/// backend type. Compound types live in memory and have no scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    I8,
    I32,
    I64,
    F64,
    Ptr,
}

/// A named record/class/variant member.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: TypeId,
    pub is_static: bool,
}

/// A class member function descriptor. The body is compiled as a
/// free function named `<class>.<name>`; virtual members also occupy
/// a vtable slot.
#[derive(Debug, Clone)]
pub struct MemberFunc {
    pub name: String,
    pub sig: FuncSig,
    pub is_virtual: bool,
    pub is_override: bool,
    pub is_static: bool,
    /// Slot index in the class vtable, for virtual/override members.
    pub vtable_index: Option<usize>,
}

/// One vtable slot: the method name and the class whose
/// implementation currently fills the slot.
#[derive(Debug, Clone)]
pub struct VtableSlot {
    pub name: String,
    pub impl_class: String,
    pub sig: FuncSig,
}

/// A function signature as the type system sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncSig {
    pub params: Vec<Param>,
    pub ret: TypeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub ty: TypeId,
    pub by_ref: bool,
}

/// Target of a pointer type: either resolved, or a name still
/// waiting for its declaration later in the same `type` block.
#[derive(Debug, Clone)]
pub enum PtrTarget {
    Resolved(TypeId),
    Pending(String),
}

/// The type entity sum.
#[derive(Debug, Clone)]
pub enum Type {
    Integer,
    Int64,
    Real,
    Char,
    Boolean,
    Void,
    /// Enumeration; the value names are held for dumps, the ordinals
    /// are their indices.
    Enum { names: Vec<String> },
    /// Integral subrange over `base`.
    Range { base: TypeId, low: i64, high: i64 },
    Pointer { target: PtrTarget },
    /// One element type and an ordered list of Range index types;
    /// element count is the product of the range sizes.
    Array { element: TypeId, ranges: Vec<TypeId> },
    Record { fields: Vec<Field>, variant: Option<TypeId> },
    /// Variant part of a record: the tail storage shared by the
    /// alternatives. Each alternative is a Field whose type is an
    /// anonymous Record of that alternative's members.
    Variant { alts: Vec<Field> },
    /// Object type: fields plus single inheritance and members.
    Class {
        name: String,
        base: Option<TypeId>,
        fields: Vec<Field>,
        members: Vec<MemberFunc>,
        vtable: Vec<VtableSlot>,
    },
    /// `file of base`; `text` is the is_text subkind over Char.
    File { base: TypeId, is_text: bool },
    /// Bitmap set over an integral element type restricted to
    /// `low..high`.
    Set { base: TypeId, low: i64, high: i64 },
    /// `string[capacity]`: a length byte followed by the bytes.
    String { capacity: u32 },
    /// A named function/procedure used as a value or through a
    /// pointer; both faces share the one prototype-carrying entity.
    Function(FuncSig),
}

/// Coarse tag used where only the variant matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Integer,
    Int64,
    Real,
    Char,
    Boolean,
    Void,
    Enum,
    Range,
    Pointer,
    Array,
    Record,
    Variant,
    Class,
    File,
    Set,
    String,
    Function,
}

// ═══════════════════════════════════════════════════════════════
// Arena
// ═══════════════════════════════════════════════════════════════

/// Owns every type entity of one compilation. Primitive types are
/// interned up front; everything else is added by the parser as
/// declarations are seen.
pub struct TypeArena {
    types: Vec<Type>,
    pub void: TypeId,
    pub integer: TypeId,
    pub int64: TypeId,
    pub real: TypeId,
    pub char: TypeId,
    pub boolean: TypeId,
    pub text: TypeId,
    /// The type of `nil`: a pointer with a void target.
    pub nil: TypeId,
    /// `string` without an explicit capacity.
    pub string_default: TypeId,
}

impl TypeArena {
    pub fn new() -> Self {
        let mut types = Vec::new();
        let mut add = |t: Type| {
            let id = TypeId(types.len() as u32);
            types.push(t);
            id
        };
        let void = add(Type::Void);
        let integer = add(Type::Integer);
        let int64 = add(Type::Int64);
        let real = add(Type::Real);
        let char = add(Type::Char);
        let boolean = add(Type::Boolean);
        let text = add(Type::File {
            base: char,
            is_text: true,
        });
        let nil = add(Type::Pointer {
            target: PtrTarget::Resolved(void),
        });
        let string_default = add(Type::String {
            capacity: MAX_STRING_CAPACITY as u32,
        });
        TypeArena {
            types,
            void,
            integer,
            int64,
            real,
            char,
            boolean,
            text,
            nil,
            string_default,
        }
    }

    pub fn add(&mut self, t: Type) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(t);
        id
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.index()]
    }

    /// Every TypeId in the arena, in creation order.
    pub fn type_ids(&self) -> impl Iterator<Item = TypeId> + '_ {
        (0..self.types.len() as u32).map(TypeId)
    }

    fn get_mut(&mut self, id: TypeId) -> &mut Type {
        &mut self.types[id.index()]
    }

    pub fn kind(&self, id: TypeId) -> TypeKind {
        match self.get(id) {
            Type::Integer => TypeKind::Integer,
            Type::Int64 => TypeKind::Int64,
            Type::Real => TypeKind::Real,
            Type::Char => TypeKind::Char,
            Type::Boolean => TypeKind::Boolean,
            Type::Void => TypeKind::Void,
            Type::Enum { .. } => TypeKind::Enum,
            Type::Range { .. } => TypeKind::Range,
            Type::Pointer { .. } => TypeKind::Pointer,
            Type::Array { .. } => TypeKind::Array,
            Type::Record { .. } => TypeKind::Record,
            Type::Variant { .. } => TypeKind::Variant,
            Type::Class { .. } => TypeKind::Class,
            Type::File { .. } => TypeKind::File,
            Type::Set { .. } => TypeKind::Set,
            Type::String { .. } => TypeKind::String,
            Type::Function(_) => TypeKind::Function,
        }
    }

    // ── Forward pointer resolution ─────────────────────────────

    /// Patch every pending pointer target using `lookup`. Returns the
    /// names that could not be resolved (a compile error for each).
    pub fn resolve_pending<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<TypeId>,
    {
        let mut unresolved = Vec::new();
        for i in 0..self.types.len() {
            let pending = match &self.types[i] {
                Type::Pointer {
                    target: PtrTarget::Pending(name),
                } => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = pending {
                match lookup(&name) {
                    Some(target) => {
                        self.types[i] = Type::Pointer {
                            target: PtrTarget::Resolved(target),
                        };
                    }
                    None => unresolved.push(name),
                }
            }
        }
        unresolved
    }

    // ── Classification ─────────────────────────────────────────

    /// Strip subranges down to their base type.
    pub fn base_of(&self, id: TypeId) -> TypeId {
        match self.get(id) {
            Type::Range { base, .. } => self.base_of(*base),
            _ => id,
        }
    }

    pub fn is_integral(&self, id: TypeId) -> bool {
        matches!(
            self.get(self.base_of(id)),
            Type::Integer | Type::Int64 | Type::Char | Type::Boolean | Type::Enum { .. }
        )
    }

    pub fn is_compound(&self, id: TypeId) -> bool {
        matches!(
            self.get(id),
            Type::Array { .. }
                | Type::Record { .. }
                | Type::Variant { .. }
                | Type::Class { .. }
                | Type::Set { .. }
                | Type::String { .. }
                | Type::File { .. }
        )
    }

    /// The ordinal value range of an integral type.
    pub fn get_range(&self, id: TypeId) -> Option<(i64, i64)> {
        match self.get(id) {
            Type::Integer => Some((i32::MIN as i64, i32::MAX as i64)),
            Type::Int64 => Some((i64::MIN, i64::MAX)),
            Type::Char => Some((0, 255)),
            Type::Boolean => Some((0, 1)),
            Type::Enum { names } => Some((0, names.len() as i64 - 1)),
            Type::Range { low, high, .. } => Some((*low, *high)),
            _ => None,
        }
    }

    /// The contained type, where one exists: pointer target, array
    /// element, file base, set element.
    pub fn sub_type(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id) {
            Type::Pointer {
                target: PtrTarget::Resolved(t),
            } => Some(*t),
            Type::Array { element, .. } => Some(*element),
            Type::File { base, .. } => Some(*base),
            Type::Set { base, .. } => Some(*base),
            _ => None,
        }
    }

    /// The backend scalar for value-representable types; None for
    /// compounds (they are manipulated through their address).
    pub fn scalar(&self, id: TypeId) -> Option<Scalar> {
        match self.get(id) {
            Type::Integer | Type::Enum { .. } => Some(Scalar::I32),
            Type::Int64 => Some(Scalar::I64),
            Type::Real => Some(Scalar::F64),
            Type::Char | Type::Boolean => Some(Scalar::I8),
            Type::Range { base, .. } => self.scalar(*base),
            Type::Pointer { .. } | Type::Function(_) => Some(Scalar::Ptr),
            _ => None,
        }
    }

    // ── Layout ─────────────────────────────────────────────────

    pub fn align(&self, id: TypeId) -> u32 {
        match self.get(id) {
            Type::Void => 1,
            Type::Integer | Type::Enum { .. } => 4,
            Type::Int64 | Type::Real => 8,
            Type::Char | Type::Boolean => 1,
            Type::Range { base, .. } => self.align(*base),
            Type::Pointer { .. } | Type::Function(_) => 8,
            Type::Array { element, .. } => self.align(*element),
            Type::Record { fields, variant } => {
                let mut a = 1;
                for f in fields {
                    a = a.max(self.align(f.ty));
                }
                if let Some(v) = variant {
                    a = a.max(self.align(*v));
                }
                a
            }
            Type::Variant { alts } => {
                let mut a = 1;
                for f in alts {
                    a = a.max(self.align(f.ty));
                }
                a
            }
            Type::Class { .. } => {
                let mut a = if self.class_has_vtable(id) { 8 } else { 1 };
                let mut cur = Some(id);
                while let Some(c) = cur {
                    if let Type::Class { base, fields, .. } = self.get(c) {
                        for f in fields {
                            a = a.max(self.align(f.ty));
                        }
                        cur = *base;
                    } else {
                        break;
                    }
                }
                a
            }
            Type::File { .. } => 8,
            Type::Set { .. } => 4,
            Type::String { .. } => 1,
        }
    }

    pub fn size(&self, id: TypeId) -> u32 {
        match self.get(id) {
            Type::Void => 0,
            Type::Integer | Type::Enum { .. } => 4,
            Type::Int64 | Type::Real => 8,
            Type::Char | Type::Boolean => 1,
            Type::Range { base, .. } => self.size(*base),
            Type::Pointer { .. } | Type::Function(_) => 8,
            Type::Array { element, ranges } => {
                let mut count: u64 = 1;
                for r in ranges {
                    let (low, high) = self.get_range(*r).unwrap_or((0, -1));
                    count *= (high - low + 1).max(0) as u64;
                }
                (count * self.size(*element) as u64) as u32
            }
            Type::Record { .. } => {
                let (size, align) = self.record_layout(id);
                round_up(size, align)
            }
            Type::Variant { alts } => {
                let mut max_size = 0;
                let mut align = 1;
                for f in alts {
                    max_size = max_size.max(self.size(f.ty));
                    align = align.max(self.align(f.ty));
                }
                round_up(max_size, align)
            }
            Type::Class { .. } => {
                let align = self.align(id);
                round_up(self.class_fields_end(id), align)
            }
            // { handle: i32, buffer: ptr, record_size: i32, is_text: u8 }
            Type::File { .. } => 24,
            Type::Set { low, high, .. } => self.set_words_for(*low, *high) * 4,
            Type::String { capacity } => capacity + 1,
        }
    }

    fn set_words_for(&self, low: i64, high: i64) -> u32 {
        let elems = (high - low + 1).max(0) as u32;
        elems.div_ceil(SET_BITS).max(1)
    }

    /// Number of 32-bit words in a set type's bitmap.
    pub fn set_words(&self, id: TypeId) -> u32 {
        match self.get(id) {
            Type::Set { low, high, .. } => self.set_words_for(*low, *high),
            _ => 0,
        }
    }

    /// Walk a record's plain fields assigning offsets; returns the
    /// unrounded end offset and the record alignment. The variant
    /// part, if any, is placed after the plain fields.
    fn record_layout(&self, id: TypeId) -> (u32, u32) {
        let Type::Record { fields, variant } = self.get(id) else {
            return (0, 1);
        };
        let mut offset = 0;
        let mut align = 1;
        for f in fields {
            let fa = self.align(f.ty);
            align = align.max(fa);
            offset = round_up(offset, fa) + self.size(f.ty);
        }
        if let Some(v) = variant {
            let va = self.align(*v);
            align = align.max(va);
            offset = round_up(offset, va) + self.size(*v);
        }
        (offset, align)
    }

    /// Byte offset of plain field `n` in a record.
    pub fn record_field_offset(&self, id: TypeId, n: usize) -> u32 {
        let Type::Record { fields, .. } = self.get(id) else {
            return 0;
        };
        let mut offset = 0;
        for (i, f) in fields.iter().enumerate() {
            let fa = self.align(f.ty);
            offset = round_up(offset, fa);
            if i == n {
                return offset;
            }
            offset += self.size(f.ty);
        }
        offset
    }

    /// Byte offset of the variant storage in a record.
    pub fn record_variant_offset(&self, id: TypeId) -> u32 {
        let Type::Record { fields, variant } = self.get(id) else {
            return 0;
        };
        let mut offset = 0;
        for f in fields {
            let fa = self.align(f.ty);
            offset = round_up(offset, fa) + self.size(f.ty);
        }
        if let Some(v) = variant {
            offset = round_up(offset, self.align(*v));
        }
        offset
    }

    // ── Classes ────────────────────────────────────────────────

    /// True when the class or any ancestor declares a virtual or
    /// override member, i.e. when instances carry a vtable pointer.
    pub fn class_has_vtable(&self, id: TypeId) -> bool {
        let mut cur = Some(id);
        while let Some(c) = cur {
            match self.get(c) {
                Type::Class { base, members, .. } => {
                    if members.iter().any(|m| m.is_virtual || m.is_override) {
                        return true;
                    }
                    cur = *base;
                }
                _ => break,
            }
        }
        false
    }

    /// Ancestor chain from root-most to the class itself.
    fn class_chain(&self, id: TypeId) -> Vec<TypeId> {
        let mut chain = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            chain.push(c);
            cur = match self.get(c) {
                Type::Class { base, .. } => *base,
                _ => None,
            };
        }
        chain.reverse();
        chain
    }

    /// End offset of the last instance field (unrounded).
    fn class_fields_end(&self, id: TypeId) -> u32 {
        let mut offset = if self.class_has_vtable(id) { 8 } else { 0 };
        for c in self.class_chain(id) {
            if let Type::Class { fields, .. } = self.get(c) {
                for f in fields.iter().filter(|f| !f.is_static) {
                    let fa = self.align(f.ty);
                    offset = round_up(offset, fa) + self.size(f.ty);
                }
            }
        }
        offset
    }

    /// Find an instance field by name anywhere in the class chain;
    /// returns its byte offset and type.
    pub fn class_field(&self, id: TypeId, name: &str) -> Option<(u32, TypeId)> {
        let lname = name.to_ascii_lowercase();
        let mut offset = if self.class_has_vtable(id) { 8 } else { 0 };
        for c in self.class_chain(id) {
            if let Type::Class { fields, .. } = self.get(c) {
                for f in fields.iter().filter(|f| !f.is_static) {
                    let fa = self.align(f.ty);
                    offset = round_up(offset, fa);
                    if f.name.to_ascii_lowercase() == lname {
                        return Some((offset, f.ty));
                    }
                    offset += self.size(f.ty);
                }
            }
        }
        None
    }

    /// Find a member function by name in the class chain; returns
    /// the descriptor and the class that declares it.
    pub fn class_member(&self, id: TypeId, name: &str) -> Option<(MemberFunc, TypeId)> {
        let lname = name.to_ascii_lowercase();
        let mut cur = Some(id);
        while let Some(c) = cur {
            match self.get(c) {
                Type::Class { base, members, .. } => {
                    if let Some(m) = members
                        .iter()
                        .find(|m| m.name.to_ascii_lowercase() == lname)
                    {
                        return Some((m.clone(), c));
                    }
                    cur = *base;
                }
                _ => break,
            }
        }
        None
    }

    pub fn class_name(&self, id: TypeId) -> Option<&str> {
        match self.get(id) {
            Type::Class { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn class_vtable(&self, id: TypeId) -> &[VtableSlot] {
        match self.get(id) {
            Type::Class { vtable, .. } => vtable,
            _ => &[],
        }
    }

    /// Install the parsed body of a class added earlier as an empty
    /// placeholder (declaration is two-phase so member signatures can
    /// refer to the class itself).
    pub fn fill_class(
        &mut self,
        id: TypeId,
        fields: Vec<Field>,
        members: Vec<MemberFunc>,
        vtable: Vec<VtableSlot>,
    ) {
        if let Type::Class {
            fields: f,
            members: m,
            vtable: v,
            ..
        } = self.get_mut(id)
        {
            *f = fields;
            *m = members;
            *v = vtable;
        }
    }

    /// Instance field names of a class, root-most ancestor first.
    pub fn class_field_names(&self, id: TypeId) -> Vec<String> {
        let mut out = Vec::new();
        for c in self.class_chain(id) {
            if let Type::Class { fields, .. } = self.get(c) {
                for f in fields.iter().filter(|f| !f.is_static) {
                    out.push(f.name.clone());
                }
            }
        }
        out
    }

    /// True when `ancestor` is `id` itself or one of its bases.
    pub fn is_ancestor_of(&self, ancestor: TypeId, id: TypeId) -> bool {
        self.class_chain(id).contains(&ancestor)
    }

    // ── Identity and compatibility ─────────────────────────────

    /// Structural identity. Declared entities are interned, so most
    /// cases reduce to index equality; primitives and ranges also
    /// compare structurally.
    pub fn same_as(&self, a: TypeId, b: TypeId) -> bool {
        if a == b {
            return true;
        }
        match (self.get(a), self.get(b)) {
            (Type::Integer, Type::Integer)
            | (Type::Int64, Type::Int64)
            | (Type::Real, Type::Real)
            | (Type::Char, Type::Char)
            | (Type::Boolean, Type::Boolean)
            | (Type::Void, Type::Void) => true,
            (
                Type::Range {
                    base: b1,
                    low: l1,
                    high: h1,
                },
                Type::Range {
                    base: b2,
                    low: l2,
                    high: h2,
                },
            ) => l1 == l2 && h1 == h2 && self.same_as(*b1, *b2),
            (
                Type::Set {
                    base: b1,
                    low: l1,
                    high: h1,
                },
                Type::Set {
                    base: b2,
                    low: l2,
                    high: h2,
                },
            ) => l1 == l2 && h1 == h2 && self.same_as(self.base_of(*b1), self.base_of(*b2)),
            (Type::String { capacity: c1 }, Type::String { capacity: c2 }) => c1 == c2,
            (
                Type::Pointer {
                    target: PtrTarget::Resolved(t1),
                },
                Type::Pointer {
                    target: PtrTarget::Resolved(t2),
                },
            ) => self.same_as(*t1, *t2),
            _ => false,
        }
    }

    /// Is `id` in the integer family (Integer/Int64 or a subrange of
    /// one), as opposed to char/bool/enum ordinals?
    fn is_integer_family(&self, id: TypeId) -> bool {
        matches!(self.get(self.base_of(id)), Type::Integer | Type::Int64)
    }

    /// The common type of two operands of a binary operation, or
    /// None if they cannot meet. Ranges fall back to their bases,
    /// narrower integers widen, integer meets real as real, sets
    /// must share an element base, char meets string, and class
    /// types meet at the ancestor.
    pub fn compatible_type(&self, a: TypeId, b: TypeId) -> Option<TypeId> {
        if self.same_as(a, b) {
            return Some(self.base_of(a));
        }
        let ba = self.base_of(a);
        let bb = self.base_of(b);
        if self.same_as(ba, bb) {
            return Some(ba);
        }
        match (self.get(ba), self.get(bb)) {
            (Type::Integer, Type::Int64) | (Type::Int64, Type::Integer) => Some(self.int64),
            (Type::Real, t) if integerish(t) => Some(self.real),
            (t, Type::Real) if integerish(t) => Some(self.real),
            (Type::Set { base: e1, .. }, Type::Set { base: e2, .. })
                if self.same_as(self.base_of(*e1), self.base_of(*e2)) =>
            {
                Some(a)
            }
            (Type::Char, Type::String { capacity }) if *capacity >= 1 => Some(bb),
            (Type::String { capacity }, Type::Char) if *capacity >= 1 => Some(ba),
            (Type::String { .. }, Type::String { .. }) => Some(ba),
            (Type::Class { .. }, Type::Class { .. }) => {
                if self.is_ancestor_of(ba, bb) {
                    Some(ba)
                } else if self.is_ancestor_of(bb, ba) {
                    Some(bb)
                } else {
                    None
                }
            }
            (Type::Pointer { .. }, Type::Pointer { .. }) => {
                // nil is compatible with any pointer
                if a == self.nil {
                    Some(b)
                } else if b == self.nil {
                    Some(a)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// May a value of type `rhs` be stored into a location of type
    /// `lhs`? Strictly narrower than compatibility.
    pub fn assignable_type(&self, lhs: TypeId, rhs: TypeId) -> bool {
        if self.same_as(lhs, rhs) {
            return true;
        }
        let bl = self.base_of(lhs);
        let br = self.base_of(rhs);
        match (self.get(bl), self.get(br)) {
            // Any integer into a real.
            (Type::Real, t) if integerish(t) => true,
            // Within one ordinal family: bounds must be statically
            // inside the destination's range.
            _ if self.is_integral(lhs) && self.is_integral(rhs) => {
                if self.is_integer_family(lhs) && self.is_integer_family(rhs) {
                    let (ll, lh) = self.get_range(lhs).unwrap();
                    let (rl, rh) = self.get_range(rhs).unwrap();
                    // A plain Integer fits in Int64; a subrange fits
                    // when its bounds do.
                    rl >= ll && rh <= lh || self.same_as(bl, br)
                } else if self.same_as(bl, br) {
                    let (ll, lh) = self.get_range(lhs).unwrap();
                    let (rl, rh) = self.get_range(rhs).unwrap();
                    rl >= ll && rh <= lh
                } else {
                    false
                }
            }
            // A subclass object into an ancestor location.
            (Type::Class { .. }, Type::Class { .. }) => self.is_ancestor_of(bl, br),
            // Strings accept chars, literals and other strings.
            (Type::String { capacity }, Type::Char) => *capacity >= 1,
            (Type::String { .. }, Type::String { .. }) => true,
            // nil into any pointer; pointers to the same target.
            (Type::Pointer { .. }, Type::Pointer { .. }) => {
                rhs == self.nil || self.same_as(bl, br)
            }
            // Sets of the same element base and word count.
            (
                Type::Set { base: e1, .. },
                Type::Set { base: e2, .. },
            ) => {
                self.same_as(self.base_of(*e1), self.base_of(*e2))
                    && self.set_words(bl) == self.set_words(br)
            }
            _ => false,
        }
    }

    // ── Initial images ─────────────────────────────────────────

    /// Stores needed to give a fresh variable of this type its
    /// initial image: one `(offset, class)` per embedded vtable
    /// pointer. Empty for types that are all-zero initially.
    pub fn init_image(&self, id: TypeId) -> Vec<(u32, TypeId)> {
        let mut out = Vec::new();
        self.collect_init(id, 0, &mut out);
        out
    }

    fn collect_init(&self, id: TypeId, base_off: u32, out: &mut Vec<(u32, TypeId)>) {
        match self.get(id) {
            Type::Class { .. } => {
                if self.class_has_vtable(id) {
                    out.push((base_off, id));
                }
                // Class-typed fields nested inside objects are laid
                // out flat; recurse over the chain's fields.
                let mut offset = base_off + if self.class_has_vtable(id) { 8 } else { 0 };
                for c in self.class_chain(id) {
                    if let Type::Class { fields, .. } = self.get(c) {
                        for f in fields.iter().filter(|f| !f.is_static) {
                            let fa = self.align(f.ty);
                            offset = round_up(offset, fa);
                            self.collect_init(f.ty, offset, out);
                            offset += self.size(f.ty);
                        }
                    }
                }
            }
            Type::Record { fields, .. } => {
                for (i, f) in fields.iter().enumerate() {
                    self.collect_init(f.ty, base_off + self.record_field_offset(id, i), out);
                }
            }
            Type::Array { element, .. } => {
                let elem_size = self.size(*element);
                let inner = self.init_image(*element);
                if !inner.is_empty() {
                    let total = self.size(id);
                    let mut off = 0;
                    while off + elem_size <= total {
                        for (o, c) in &inner {
                            out.push((base_off + off + o, *c));
                        }
                        off += elem_size;
                    }
                }
            }
            _ => {}
        }
    }

    /// Human-readable type name for diagnostics and dumps.
    pub fn describe(&self, id: TypeId) -> String {
        match self.get(id) {
            Type::Integer => "integer".into(),
            Type::Int64 => "int64".into(),
            Type::Real => "real".into(),
            Type::Char => "char".into(),
            Type::Boolean => "boolean".into(),
            Type::Void => "void".into(),
            Type::Enum { names } => format!("({})", names.join(", ")),
            Type::Range { low, high, .. } => format!("{}..{}", low, high),
            Type::Pointer {
                target: PtrTarget::Resolved(t),
            } => format!("^{}", self.describe(*t)),
            Type::Pointer {
                target: PtrTarget::Pending(n),
            } => format!("^{} (unresolved)", n),
            Type::Array { element, ranges } => {
                let idx: Vec<String> = ranges.iter().map(|r| self.describe(*r)).collect();
                format!("array [{}] of {}", idx.join(", "), self.describe(*element))
            }
            Type::Record { .. } => "record".into(),
            Type::Variant { .. } => "variant".into(),
            Type::Class { name, .. } => name.clone(),
            Type::File { base, is_text } => {
                if *is_text {
                    "text".into()
                } else {
                    format!("file of {}", self.describe(*base))
                }
            }
            Type::Set { low, high, .. } => format!("set of {}..{}", low, high),
            Type::String { capacity } => format!("string[{}]", capacity),
            Type::Function(_) => "function".into(),
        }
    }
}

impl Default for TypeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeArena {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "TypeArena ({} entries)", self.types.len())?;
        for (i, _) in self.types.iter().enumerate() {
            writeln!(f, "  #{}: {}", i, self.describe(TypeId(i as u32)))?;
        }
        Ok(())
    }
}

fn integerish(t: &Type) -> bool {
    matches!(t, Type::Integer | Type::Int64)
}

fn round_up(v: u32, align: u32) -> u32 {
    debug_assert!(align > 0);
    (v + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(arena: &mut TypeArena, low: i64, high: i64) -> TypeId {
        let base = arena.integer;
        arena.add(Type::Range { base, low, high })
    }

    #[test]
    fn test_primitive_layout() {
        let arena = TypeArena::new();
        assert_eq!(arena.size(arena.integer), 4);
        assert_eq!(arena.size(arena.int64), 8);
        assert_eq!(arena.size(arena.real), 8);
        assert_eq!(arena.size(arena.char), 1);
        assert_eq!(arena.size(arena.boolean), 1);
        assert_eq!(arena.align(arena.real), 8);
    }

    #[test]
    fn test_array_size_scales_with_count() {
        let mut arena = TypeArena::new();
        for n in [1i64, 7, 100] {
            let idx = range(&mut arena, 1, n);
            let arr = arena.add(Type::Array {
                element: arena.integer,
                ranges: vec![idx],
            });
            assert_eq!(arena.size(arr), (n as u32) * 4);
        }
    }

    #[test]
    fn test_multi_dim_array_size() {
        let mut arena = TypeArena::new();
        let r1 = range(&mut arena, 1, 3);
        let r2 = range(&mut arena, 0, 4);
        let arr = arena.add(Type::Array {
            element: arena.char,
            ranges: vec![r1, r2],
        });
        assert_eq!(arena.size(arr), 15);
    }

    #[test]
    fn test_set_word_layout() {
        let mut arena = TypeArena::new();
        let s32 = arena.add(Type::Set {
            base: arena.integer,
            low: 0,
            high: 31,
        });
        let s64 = arena.add(Type::Set {
            base: arena.integer,
            low: 0,
            high: 63,
        });
        let s33 = arena.add(Type::Set {
            base: arena.integer,
            low: 0,
            high: 32,
        });
        assert_eq!(arena.size(s32), 4);
        assert_eq!(arena.set_words(s32), 1);
        assert_eq!(arena.size(s64), 8);
        assert_eq!(arena.set_words(s64), 2);
        assert_eq!(arena.set_words(s33), 2);
    }

    #[test]
    fn test_string_size() {
        let mut arena = TypeArena::new();
        for n in [1u32, 10, 255] {
            let s = arena.add(Type::String { capacity: n });
            assert_eq!(arena.size(s), n + 1);
        }
    }

    #[test]
    fn test_record_layout_with_padding() {
        let mut arena = TypeArena::new();
        let rec = arena.add(Type::Record {
            fields: vec![
                Field {
                    name: "c".into(),
                    ty: arena.char,
                    is_static: false,
                },
                Field {
                    name: "r".into(),
                    ty: arena.real,
                    is_static: false,
                },
                Field {
                    name: "i".into(),
                    ty: arena.integer,
                    is_static: false,
                },
            ],
            variant: None,
        });
        assert_eq!(arena.record_field_offset(rec, 0), 0);
        assert_eq!(arena.record_field_offset(rec, 1), 8);
        assert_eq!(arena.record_field_offset(rec, 2), 16);
        assert_eq!(arena.size(rec), 24);
        assert_eq!(arena.align(rec), 8);
    }

    #[test]
    fn test_variant_sized_by_largest_alternative() {
        let mut arena = TypeArena::new();
        let alt_a = arena.add(Type::Record {
            fields: vec![Field {
                name: "x".into(),
                ty: arena.real,
                is_static: false,
            }],
            variant: None,
        });
        let alt_b = arena.add(Type::Record {
            fields: vec![Field {
                name: "y".into(),
                ty: arena.char,
                is_static: false,
            }],
            variant: None,
        });
        let var = arena.add(Type::Variant {
            alts: vec![
                Field {
                    name: "a".into(),
                    ty: alt_a,
                    is_static: false,
                },
                Field {
                    name: "b".into(),
                    ty: alt_b,
                    is_static: false,
                },
            ],
        });
        assert_eq!(arena.size(var), 8);
        assert_eq!(arena.align(var), 8);

        let rec = arena.add(Type::Record {
            fields: vec![Field {
                name: "tag".into(),
                ty: arena.integer,
                is_static: false,
            }],
            variant: Some(var),
        });
        assert_eq!(arena.record_variant_offset(rec), 8);
        assert_eq!(arena.size(rec), 16);
    }

    #[test]
    fn test_forward_pointer_resolution() {
        let mut arena = TypeArena::new();
        let p = arena.add(Type::Pointer {
            target: PtrTarget::Pending("t".into()),
        });
        let rec = arena.add(Type::Record {
            fields: vec![Field {
                name: "next".into(),
                ty: p,
                is_static: false,
            }],
            variant: None,
        });
        let unresolved = arena.resolve_pending(|name| (name == "t").then_some(rec));
        assert!(unresolved.is_empty());
        assert_eq!(arena.sub_type(p), Some(rec));
        // The record's pointer field is usable for layout now.
        assert_eq!(arena.size(rec), 8);
    }

    #[test]
    fn test_unresolved_pointer_reported() {
        let mut arena = TypeArena::new();
        arena.add(Type::Pointer {
            target: PtrTarget::Pending("ghost".into()),
        });
        let unresolved = arena.resolve_pending(|_| None);
        assert_eq!(unresolved, vec!["ghost".to_string()]);
    }

    #[test]
    fn test_compatibility_widening() {
        let mut arena = TypeArena::new();
        assert_eq!(
            arena.compatible_type(arena.integer, arena.real),
            Some(arena.real)
        );
        assert_eq!(
            arena.compatible_type(arena.integer, arena.int64),
            Some(arena.int64)
        );
        let r = range(&mut arena, 1, 10);
        assert_eq!(
            arena.compatible_type(r, arena.integer),
            Some(arena.integer)
        );
        assert_eq!(arena.compatible_type(arena.char, arena.real), None);
    }

    #[test]
    fn test_assignability() {
        let mut arena = TypeArena::new();
        // integer into real, not the reverse
        assert!(arena.assignable_type(arena.real, arena.integer));
        assert!(!arena.assignable_type(arena.integer, arena.real));
        // subrange into its base
        let r = range(&mut arena, 1, 10);
        assert!(arena.assignable_type(arena.integer, r));
        // integer into int64, not int64 into integer
        assert!(arena.assignable_type(arena.int64, arena.integer));
        assert!(!arena.assignable_type(arena.integer, arena.int64));
        // char into string
        let s = arena.add(Type::String { capacity: 10 });
        assert!(arena.assignable_type(s, arena.char));
        // nil into pointer
        let p = arena.add(Type::Pointer {
            target: PtrTarget::Resolved(arena.integer),
        });
        assert!(arena.assignable_type(p, arena.nil));
    }

    #[test]
    fn test_class_vtable_and_subtyping() {
        let mut arena = TypeArena::new();
        let sig = FuncSig {
            params: Vec::new(),
            ret: arena.void,
        };
        let b = arena.add(Type::Class {
            name: "b".into(),
            base: None,
            fields: vec![Field {
                name: "x".into(),
                ty: arena.integer,
                is_static: false,
            }],
            members: vec![MemberFunc {
                name: "m".into(),
                sig: sig.clone(),
                is_virtual: true,
                is_override: false,
                is_static: false,
                vtable_index: Some(0),
            }],
            vtable: vec![VtableSlot {
                name: "m".into(),
                impl_class: "b".into(),
                sig: sig.clone(),
            }],
        });
        let d = arena.add(Type::Class {
            name: "d".into(),
            base: Some(b),
            fields: Vec::new(),
            members: vec![MemberFunc {
                name: "m".into(),
                sig: sig.clone(),
                is_virtual: false,
                is_override: true,
                is_static: false,
                vtable_index: Some(0),
            }],
            vtable: vec![VtableSlot {
                name: "m".into(),
                impl_class: "d".into(),
                sig,
            }],
        });
        assert!(arena.class_has_vtable(b));
        assert!(arena.class_has_vtable(d));
        // vtable pointer precedes fields
        assert_eq!(arena.class_field(b, "x"), Some((8, arena.integer)));
        assert_eq!(arena.class_field(d, "x"), Some((8, arena.integer)));
        assert!(arena.is_ancestor_of(b, d));
        assert!(!arena.is_ancestor_of(d, b));
        assert!(arena.assignable_type(b, d));
        assert!(!arena.assignable_type(d, b));
        // override reuses the ancestor's slot
        assert_eq!(arena.class_vtable(d).len(), 1);
        assert_eq!(arena.class_vtable(d)[0].impl_class, "d");
        // the initial image stores one vtable pointer at offset 0
        assert_eq!(arena.init_image(d), vec![(0, d)]);
    }

    #[test]
    fn test_file_layout() {
        let arena = TypeArena::new();
        assert_eq!(arena.size(arena.text), 24);
        assert_eq!(arena.align(arena.text), 8);
    }
}
