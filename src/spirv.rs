//! Compact SPIR-V reflection.
//!
//! Extracts exactly what the pipeline assembler needs from a shader blob:
//! the stage, entry point, workgroup size, the `(set, binding)` table with
//! descriptor kinds and array counts, whether the module declares
//! non-built-in vertex inputs, and whether it uses push constants.
//!
//! Opcode and enumerant values are the literals from the SPIR-V
//! specification; only the instructions listed below are interpreted, the
//! rest of the stream is skipped by word count.

use fxhash::{FxHashMap, FxHashSet};

use crate::types::ComputeWorkgroupSize;

const SPIRV_MAGIC: u32 = 0x0723_0203;

// Opcodes
const OP_ENTRY_POINT: u16 = 15;
const OP_EXECUTION_MODE: u16 = 16;
const OP_TYPE_IMAGE: u16 = 25;
const OP_TYPE_SAMPLER: u16 = 26;
const OP_TYPE_SAMPLED_IMAGE: u16 = 27;
const OP_TYPE_ARRAY: u16 = 28;
const OP_TYPE_RUNTIME_ARRAY: u16 = 29;
const OP_TYPE_STRUCT: u16 = 30;
const OP_TYPE_POINTER: u16 = 32;
const OP_CONSTANT: u16 = 43;
const OP_SPEC_CONSTANT_TRUE: u16 = 48;
const OP_SPEC_CONSTANT_FALSE: u16 = 49;
const OP_SPEC_CONSTANT: u16 = 50;
const OP_VARIABLE: u16 = 59;
const OP_DECORATE: u16 = 71;
const OP_MEMBER_DECORATE: u16 = 72;

// Execution models
const MODEL_VERTEX: u32 = 0;
const MODEL_FRAGMENT: u32 = 4;
const MODEL_GL_COMPUTE: u32 = 5;

// Execution modes
const MODE_LOCAL_SIZE: u32 = 17;

// Decorations
const DECORATION_BLOCK: u32 = 2;
const DECORATION_BUFFER_BLOCK: u32 = 3;
const DECORATION_BUILT_IN: u32 = 11;
const DECORATION_BINDING: u32 = 33;
const DECORATION_DESCRIPTOR_SET: u32 = 34;

// Storage classes
const STORAGE_UNIFORM_CONSTANT: u32 = 0;
const STORAGE_INPUT: u32 = 1;
const STORAGE_UNIFORM: u32 = 2;
const STORAGE_PUSH_CONSTANT: u32 = 9;
const STORAGE_STORAGE_BUFFER: u32 = 12;

// Image dims
const DIM_BUFFER: u32 = 5;
const DIM_SUBPASS_DATA: u32 = 6;

#[derive(Debug, Clone)]
pub enum ReflectError {
    MissingHeader,
    WrongMagic,
    IncompleteInstruction,
    NoEntryPoint,
    UnsupportedExecutionModel(u32),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UniformKind {
    Sampler,
    SampledImage,
    StorageImage,
    CombinedImageSampler,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
    InputAttachment,
}

#[derive(Copy, Clone, Debug)]
pub struct Uniform {
    pub set: u32,
    pub binding: u32,
    pub kind: UniformKind,
    pub descriptor_count: u32,
}

#[derive(Clone, Debug)]
pub struct Reflection {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub uniforms: Vec<Uniform>,
    pub has_non_builtin_inputs: bool,
    pub has_push_constants: bool,
    pub workgroup_size: ComputeWorkgroupSize,
}

#[derive(Copy, Clone, Debug)]
enum Type {
    Image { dim: u32, sampled: u32 },
    Sampler,
    SampledImage,
    Array { element: u32, length_id: u32 },
    RuntimeArray,
    Struct,
    Pointer { pointee: u32 },
}

#[derive(Default, Copy, Clone)]
struct Decorations {
    set: Option<u32>,
    binding: Option<u32>,
    built_in: bool,
    buffer_block: bool,
}

struct Variable {
    id: u32,
    type_id: u32,
    storage_class: u32,
}

/// Converts a raw byte blob into a word stream, handling both endiannesses
/// the way shader tooling emits them.
pub(crate) fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>, ReflectError> {
    if bytes.len() < 20 || bytes.len() % 4 != 0 {
        return Err(ReflectError::MissingHeader);
    }
    let le = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let be = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let words: Vec<u32> = if le == SPIRV_MAGIC {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    } else if be == SPIRV_MAGIC {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    } else {
        return Err(ReflectError::WrongMagic);
    };
    Ok(words)
}

fn parse_string(operands: &[u32]) -> String {
    let mut bytes = Vec::new();
    'outer: for word in operands {
        for byte in word.to_le_bytes() {
            if byte == 0 {
                break 'outer;
            }
            bytes.push(byte);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn reflect(bytes: &[u8]) -> Result<Reflection, ReflectError> {
    let words = words_from_bytes(bytes)?;

    let mut stage = None;
    let mut entry_point = String::new();
    let mut workgroup_size = ComputeWorkgroupSize::default();
    let mut has_push_constants = false;

    let mut decorations: FxHashMap<u32, Decorations> = FxHashMap::default();
    let mut member_built_in: FxHashSet<u32> = FxHashSet::default();
    let mut types: FxHashMap<u32, Type> = FxHashMap::default();
    let mut constants: FxHashMap<u32, u32> = FxHashMap::default();
    let mut spec_constants: FxHashSet<u32> = FxHashSet::default();
    let mut variables: Vec<Variable> = Vec::new();

    // Instruction stream starts after the five header words.
    let mut cursor = 5;
    while cursor < words.len() {
        let first = words[cursor];
        let opcode = (first & 0xffff) as u16;
        let count = (first >> 16) as usize;
        if count == 0 || cursor + count > words.len() {
            return Err(ReflectError::IncompleteInstruction);
        }
        let operands = &words[cursor + 1..cursor + count];
        cursor += count;

        match opcode {
            OP_ENTRY_POINT => {
                stage = Some(match operands[0] {
                    MODEL_VERTEX => ShaderStage::Vertex,
                    MODEL_FRAGMENT => ShaderStage::Fragment,
                    MODEL_GL_COMPUTE => ShaderStage::Compute,
                    other => return Err(ReflectError::UnsupportedExecutionModel(other)),
                });
                entry_point = parse_string(&operands[2..]);
            }
            OP_EXECUTION_MODE => {
                if operands[1] == MODE_LOCAL_SIZE {
                    workgroup_size = ComputeWorkgroupSize {
                        x: operands[2],
                        y: operands[3],
                        z: operands[4],
                    };
                }
            }
            OP_DECORATE => {
                let entry = decorations.entry(operands[0]).or_default();
                match operands[1] {
                    DECORATION_DESCRIPTOR_SET => entry.set = Some(operands[2]),
                    DECORATION_BINDING => entry.binding = Some(operands[2]),
                    DECORATION_BUILT_IN => entry.built_in = true,
                    DECORATION_BUFFER_BLOCK => entry.buffer_block = true,
                    DECORATION_BLOCK => {}
                    _ => {}
                }
            }
            OP_MEMBER_DECORATE => {
                if operands[2] == DECORATION_BUILT_IN {
                    member_built_in.insert(operands[0]);
                }
            }
            OP_TYPE_IMAGE => {
                types.insert(
                    operands[0],
                    Type::Image {
                        dim: operands[2],
                        sampled: operands[6],
                    },
                );
            }
            OP_TYPE_SAMPLER => {
                types.insert(operands[0], Type::Sampler);
            }
            OP_TYPE_SAMPLED_IMAGE => {
                types.insert(operands[0], Type::SampledImage);
            }
            OP_TYPE_ARRAY => {
                types.insert(
                    operands[0],
                    Type::Array {
                        element: operands[1],
                        length_id: operands[2],
                    },
                );
            }
            OP_TYPE_RUNTIME_ARRAY => {
                types.insert(operands[0], Type::RuntimeArray);
            }
            OP_TYPE_STRUCT => {
                types.insert(operands[0], Type::Struct);
            }
            OP_TYPE_POINTER => {
                types.insert(
                    operands[0],
                    Type::Pointer {
                        pointee: operands[2],
                    },
                );
            }
            OP_CONSTANT => {
                // only 32-bit scalar constants matter here (array lengths)
                if operands.len() >= 3 {
                    constants.insert(operands[1], operands[2]);
                }
            }
            OP_SPEC_CONSTANT | OP_SPEC_CONSTANT_TRUE | OP_SPEC_CONSTANT_FALSE => {
                spec_constants.insert(operands[1]);
            }
            OP_VARIABLE => {
                variables.push(Variable {
                    id: operands[1],
                    type_id: operands[0],
                    storage_class: operands[2],
                });
            }
            _ => {}
        }
    }

    let stage = stage.ok_or(ReflectError::NoEntryPoint)?;

    let mut uniforms = Vec::new();
    let mut has_non_builtin_inputs = false;
    for variable in &variables {
        let var_decorations = decorations.get(&variable.id).copied().unwrap_or_default();
        match variable.storage_class {
            STORAGE_PUSH_CONSTANT => has_push_constants = true,
            STORAGE_INPUT => {
                let pointee = pointee_of(&types, variable.type_id);
                let struct_built_in =
                    matches!(pointee, Some((id, Type::Struct)) if member_built_in.contains(&id));
                if !var_decorations.built_in && !struct_built_in {
                    has_non_builtin_inputs = true;
                }
            }
            STORAGE_UNIFORM_CONSTANT | STORAGE_UNIFORM | STORAGE_STORAGE_BUFFER => {
                let (type_id, ty) = pointee_of(&types, variable.type_id)
                    .expect("descriptor variable with no resolvable type");
                let (ty, type_id, descriptor_count) =
                    strip_arrays(&types, &constants, &spec_constants, type_id, ty);
                let kind = classify(
                    variable.storage_class,
                    ty,
                    decorations.get(&type_id).copied().unwrap_or_default(),
                );
                uniforms.push(Uniform {
                    set: var_decorations
                        .set
                        .expect("descriptor variable without a DescriptorSet decoration"),
                    binding: var_decorations
                        .binding
                        .expect("descriptor variable without a Binding decoration"),
                    kind,
                    descriptor_count,
                });
            }
            _ => {}
        }
    }

    Ok(Reflection {
        stage,
        entry_point,
        uniforms,
        has_non_builtin_inputs,
        has_push_constants,
        workgroup_size,
    })
}

fn pointee_of(types: &FxHashMap<u32, Type>, pointer_type: u32) -> Option<(u32, Type)> {
    match types.get(&pointer_type)? {
        Type::Pointer { pointee } => {
            let ty = *types.get(pointee)?;
            Some((*pointee, ty))
        }
        ty => Some((pointer_type, *ty)),
    }
}

/// Peels array types off `ty`, multiplying up constant lengths. Returns the
/// element type, its id (decorations live on it, not the array), and the
/// total descriptor count.
fn strip_arrays(
    types: &FxHashMap<u32, Type>,
    constants: &FxHashMap<u32, u32>,
    spec_constants: &FxHashSet<u32>,
    mut type_id: u32,
    mut ty: Type,
) -> (Type, u32, u32) {
    let mut count = 1u32;
    loop {
        match ty {
            Type::Array { element, length_id } => {
                assert!(
                    !spec_constants.contains(&length_id),
                    "specialization-constant-sized descriptor arrays are not supported"
                );
                let length = constants
                    .get(&length_id)
                    .copied()
                    .expect("array length is not a scalar constant");
                count *= length;
                type_id = element;
                ty = *types
                    .get(&element)
                    .expect("array element type is missing from the module");
            }
            Type::RuntimeArray => {
                panic!("runtime-sized descriptor arrays are not supported")
            }
            _ => return (ty, type_id, count),
        }
    }
}

fn classify(storage_class: u32, ty: Type, type_decorations: Decorations) -> UniformKind {
    match (storage_class, ty) {
        (STORAGE_UNIFORM_CONSTANT, Type::Sampler) => UniformKind::Sampler,
        (STORAGE_UNIFORM_CONSTANT, Type::SampledImage) => UniformKind::CombinedImageSampler,
        (STORAGE_UNIFORM_CONSTANT, Type::Image { dim, sampled }) => match (dim, sampled) {
            (DIM_SUBPASS_DATA, _) => UniformKind::InputAttachment,
            (DIM_BUFFER, 2) => UniformKind::StorageTexelBuffer,
            (DIM_BUFFER, _) => UniformKind::UniformTexelBuffer,
            (_, 2) => UniformKind::StorageImage,
            _ => UniformKind::SampledImage,
        },
        (STORAGE_UNIFORM, _) if type_decorations.buffer_block => UniformKind::StorageBuffer,
        (STORAGE_UNIFORM, _) => UniformKind::UniformBuffer,
        (STORAGE_STORAGE_BUFFER, _) => UniformKind::StorageBuffer,
        _ => panic!("unsupported descriptor variable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ModuleBuilder {
        words: Vec<u32>,
    }

    impl ModuleBuilder {
        fn new() -> ModuleBuilder {
            ModuleBuilder {
                // magic, version 1.0, generator, bound, schema
                words: vec![SPIRV_MAGIC, 0x0001_0000, 0, 100, 0],
            }
        }

        fn inst(mut self, opcode: u16, operands: &[u32]) -> Self {
            self.words
                .push(opcode as u32 | (((operands.len() + 1) as u32) << 16));
            self.words.extend_from_slice(operands);
            self
        }

        fn entry_point(self, model: u32, name: &str) -> Self {
            let mut operands = vec![model, 1];
            let mut bytes: Vec<u8> = name.as_bytes().to_vec();
            bytes.push(0);
            while bytes.len() % 4 != 0 {
                bytes.push(0);
            }
            for chunk in bytes.chunks_exact(4) {
                operands.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
            self.inst(OP_ENTRY_POINT, &operands)
        }

        fn bytes(self) -> Vec<u8> {
            self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
        }
    }

    #[test]
    fn reflects_compute_storage_buffer() {
        let module = ModuleBuilder::new()
            .entry_point(MODEL_GL_COMPUTE, "main")
            .inst(OP_EXECUTION_MODE, &[1, MODE_LOCAL_SIZE, 8, 4, 1])
            .inst(OP_DECORATE, &[10, DECORATION_DESCRIPTOR_SET, 0])
            .inst(OP_DECORATE, &[10, DECORATION_BINDING, 1])
            .inst(OP_DECORATE, &[5, DECORATION_BUFFER_BLOCK])
            .inst(OP_TYPE_STRUCT, &[5])
            .inst(OP_TYPE_POINTER, &[6, STORAGE_UNIFORM, 5])
            .inst(OP_VARIABLE, &[6, 10, STORAGE_UNIFORM])
            .bytes();
        let reflection = reflect(&module).unwrap();
        assert_eq!(reflection.stage, ShaderStage::Compute);
        assert_eq!(reflection.entry_point, "main");
        assert_eq!(
            reflection.workgroup_size,
            ComputeWorkgroupSize { x: 8, y: 4, z: 1 }
        );
        assert_eq!(reflection.uniforms.len(), 1);
        let uniform = &reflection.uniforms[0];
        assert_eq!(uniform.set, 0);
        assert_eq!(uniform.binding, 1);
        assert_eq!(uniform.kind, UniformKind::StorageBuffer);
        assert_eq!(uniform.descriptor_count, 1);
        assert!(!reflection.has_push_constants);
    }

    #[test]
    fn reflects_sampler_array_with_constant_size() {
        let module = ModuleBuilder::new()
            .entry_point(MODEL_FRAGMENT, "main")
            .inst(OP_DECORATE, &[20, DECORATION_DESCRIPTOR_SET, 1])
            .inst(OP_DECORATE, &[20, DECORATION_BINDING, 0])
            .inst(OP_TYPE_IMAGE, &[7, 6, 1, 0, 0, 0, 1, 0])
            .inst(OP_TYPE_SAMPLED_IMAGE, &[8, 7])
            .inst(OP_CONSTANT, &[2, 9, 4])
            .inst(OP_TYPE_ARRAY, &[11, 8, 9])
            .inst(OP_TYPE_POINTER, &[12, STORAGE_UNIFORM_CONSTANT, 11])
            .inst(OP_VARIABLE, &[12, 20, STORAGE_UNIFORM_CONSTANT])
            .bytes();
        let reflection = reflect(&module).unwrap();
        let uniform = &reflection.uniforms[0];
        assert_eq!(uniform.kind, UniformKind::CombinedImageSampler);
        assert_eq!(uniform.descriptor_count, 4);
        assert_eq!(uniform.set, 1);
    }

    #[test]
    fn detects_push_constants_and_vertex_inputs() {
        let module = ModuleBuilder::new()
            .entry_point(MODEL_VERTEX, "main")
            .inst(OP_TYPE_STRUCT, &[5])
            .inst(OP_TYPE_POINTER, &[6, STORAGE_PUSH_CONSTANT, 5])
            .inst(OP_VARIABLE, &[6, 10, STORAGE_PUSH_CONSTANT])
            .inst(OP_TYPE_POINTER, &[7, STORAGE_INPUT, 5])
            .inst(OP_VARIABLE, &[7, 11, STORAGE_INPUT])
            .bytes();
        let reflection = reflect(&module).unwrap();
        assert!(reflection.has_push_constants);
        assert!(reflection.has_non_builtin_inputs);
    }

    #[test]
    fn builtin_inputs_are_not_reported() {
        let module = ModuleBuilder::new()
            .entry_point(MODEL_VERTEX, "main")
            .inst(OP_DECORATE, &[11, DECORATION_BUILT_IN, 42])
            .inst(OP_TYPE_STRUCT, &[5])
            .inst(OP_TYPE_POINTER, &[7, STORAGE_INPUT, 5])
            .inst(OP_VARIABLE, &[7, 11, STORAGE_INPUT])
            .bytes();
        let reflection = reflect(&module).unwrap();
        assert!(!reflection.has_non_builtin_inputs);
    }

    #[test]
    fn rejects_wrong_magic() {
        let bytes = [0u8; 24];
        assert!(matches!(reflect(&bytes), Err(ReflectError::WrongMagic)));
    }
}
